use core::fmt;
use std::io;
use std::time::Duration;

use crate::chunker::ShardKey;
use crate::protocol::{Kind, ProtocolError, Status};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not connect to {addr}: {source}")]
    Unreachable {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("`{0}` not found")]
    NotFound(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Fanout(#[from] FanoutError),
    #[error("remote reported {status}: {reason}")]
    Remote { status: Status, reason: String },
}

impl Error {
    /// The status this error is reported with on the wire.
    pub fn status(&self) -> Status {
        match self {
            Self::Unreachable { .. } => Status::Unreachable,
            Self::Io(_) => Status::Failed,
            Self::Protocol(_) => Status::Protocol,
            Self::NotFound(_) => Status::NotFound,
            Self::Timeout(_) => Status::Timeout,
            Self::Fanout(fanout) => fanout.status(),
            Self::Remote { status, .. } => *status,
        }
    }

    /// Turns a failure status read off the wire back into an error about `name`.
    pub(crate) fn from_status(status: Status, reason: String, name: &str) -> Self {
        match status {
            Status::NotFound => Self::NotFound(name.into()),
            status => Self::Remote { status, reason },
        }
    }
}

/// Some or all of the per-shard operations behind one logical request failed.
#[derive(Debug)]
pub struct FanoutError {
    pub op: Kind,
    pub file_name: String,
    pub total: usize,
    pub failures: Vec<(ShardKey, Error)>,
}

impl FanoutError {
    /// `true` if at least one shard operation succeeded.
    pub fn is_partial(&self) -> bool {
        self.failures.len() < self.total
    }

    /// A uniform failure across every shard keeps its own status (a file that
    /// was never stored is `NotFound`); anything else is `Incomplete`.
    pub fn status(&self) -> Status {
        let mut statuses = self.failures.iter().map(|(_, err)| err.status());
        let Some(first) = statuses.next() else {
            return Status::Failed;
        };
        if !self.is_partial() && statuses.all(|status| status == first) {
            first
        } else {
            Status::Incomplete
        }
    }
}

impl fmt::Display for FanoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of `{}` failed on {} of {} shards",
            self.op,
            self.file_name,
            self.failures.len(),
            self.total
        )?;
        for (shard, err) in &self.failures {
            write!(f, "; shard {shard}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FanoutError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|(_, err)| err as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("topology needs at least one storage node endpoint")]
    EmptyTopology,
    #[error("invalid endpoint `{0}`, expected `host:port`")]
    InvalidEndpoint(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard(key: u32) -> ShardKey {
        ShardKey::new(key).unwrap()
    }

    fn fanout(total: usize, failures: Vec<(ShardKey, Error)>) -> FanoutError {
        FanoutError {
            op: Kind::Fetch,
            file_name: "demo.txt".into(),
            total,
            failures,
        }
    }

    #[test]
    fn test_uniform_not_found_is_not_found() {
        let err = fanout(
            2,
            vec![
                (shard(1), Error::NotFound("ch1-demo.txt".into())),
                (shard(2), Error::NotFound("ch2-demo.txt".into())),
            ],
        );
        assert!(!err.is_partial());
        assert_eq!(err.status(), Status::NotFound);
    }

    #[test]
    fn test_partial_failure_is_incomplete() {
        let err = fanout(4, vec![(shard(3), Error::NotFound("ch3-demo.txt".into()))]);
        assert!(err.is_partial());
        assert_eq!(err.status(), Status::Incomplete);
        assert_eq!(Error::from(err).status(), Status::Incomplete);
    }

    #[test]
    fn test_mixed_failures_are_incomplete() {
        let err = fanout(
            2,
            vec![
                (shard(1), Error::NotFound("ch1-demo.txt".into())),
                (shard(2), Error::Timeout(Duration::from_secs(1))),
            ],
        );
        assert_eq!(err.status(), Status::Incomplete);

        let message = err.to_string();
        assert!(message.contains("fetch of `demo.txt` failed on 2 of 2 shards"));
        assert!(message.contains("shard 2: timed out"));
    }

    #[test]
    fn test_not_found_status_round_trips() {
        let err = Error::from_status(Status::NotFound, "whatever".into(), "demo.txt");
        assert!(matches!(err, Error::NotFound(name) if name == "demo.txt"));

        let err = Error::from_status(Status::Incomplete, "shard 2 down".into(), "demo.txt");
        assert_eq!(err.status(), Status::Incomplete);
    }
}
