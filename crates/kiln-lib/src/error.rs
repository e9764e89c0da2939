use thiserror::Error;

/// Public error taxonomy of the engine. Internal plumbing uses
/// `anyhow::Result`; operations classify the chain at the boundary with
/// [`EngineError::classify`] so embedders get a stable set of kinds.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("modpack archive is corrupt: {0}")]
    CorruptArchive(String),

    #[error("archive carries neither a CurseForge manifest nor a Modrinth index")]
    UnknownManifest,

    #[error("mod registry rejected the request (401 unauthorized)")]
    CurseforgeUnauthorized,

    #[error("mod registry denied access (403 forbidden)")]
    CurseforgeForbidden,

    #[error("mod registry unreachable: {0}")]
    RegistryNetwork(String),

    #[error("downloaded file hash mismatch for {file}: expected {expected}, got {actual}")]
    HashMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error("file is in use by another process: {0}")]
    FileInUse(String),

    #[error("disk is full")]
    DiskSpaceFull,

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("loader installation incomplete, missing {0}; run repair")]
    LoaderIncomplete(String),

    #[error("game process failed before startup: {0}")]
    JavaError(String),

    #[error("another operation is already running for instance {0}")]
    Busy(String),

    #[error(transparent)]
    Unknown(#[from] anyhow::Error),
}

impl EngineError {
    /// Exit code contract for a CLI wrapper: 0 success, 1 user error,
    /// 2 network, 3 integrity, 4 unknown.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::CurseforgeUnauthorized
            | EngineError::CurseforgeForbidden
            | EngineError::PermissionDenied(_)
            | EngineError::Busy(_) => 1,
            EngineError::RegistryNetwork(_) => 2,
            EngineError::CorruptArchive(_)
            | EngineError::UnknownManifest
            | EngineError::HashMismatch { .. }
            | EngineError::LoaderIncomplete(_) => 3,
            _ => 4,
        }
    }

    /// True when retrying the same operation may help (transient causes).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::RegistryNetwork(_) | EngineError::FileInUse(_)
        )
    }

    /// Collapse an `anyhow` chain into the taxonomy. An `EngineError`
    /// anywhere in the chain wins; otherwise io/reqwest causes are inspected.
    pub fn classify(err: anyhow::Error) -> EngineError {
        for cause in err.chain() {
            if let Some(engine) = cause.downcast_ref::<EngineError>() {
                return match engine {
                    EngineError::CorruptArchive(s) => EngineError::CorruptArchive(s.clone()),
                    EngineError::UnknownManifest => EngineError::UnknownManifest,
                    EngineError::CurseforgeUnauthorized => EngineError::CurseforgeUnauthorized,
                    EngineError::CurseforgeForbidden => EngineError::CurseforgeForbidden,
                    EngineError::RegistryNetwork(s) => EngineError::RegistryNetwork(s.clone()),
                    EngineError::HashMismatch {
                        file,
                        expected,
                        actual,
                    } => EngineError::HashMismatch {
                        file: file.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    },
                    EngineError::FileInUse(s) => EngineError::FileInUse(s.clone()),
                    EngineError::DiskSpaceFull => EngineError::DiskSpaceFull,
                    EngineError::PermissionDenied(s) => EngineError::PermissionDenied(s.clone()),
                    EngineError::LoaderIncomplete(s) => EngineError::LoaderIncomplete(s.clone()),
                    EngineError::JavaError(s) => EngineError::JavaError(s.clone()),
                    EngineError::Busy(s) => EngineError::Busy(s.clone()),
                    EngineError::Unknown(_) => EngineError::Unknown(anyhow::anyhow!("{}", engine)),
                };
            }
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if let Some(kind) = classify_io(io) {
                    return kind;
                }
            }
            if let Some(req) = cause.downcast_ref::<reqwest::Error>() {
                if req.is_connect() || req.is_timeout() {
                    return EngineError::RegistryNetwork(req.to_string());
                }
            }
        }
        EngineError::Unknown(err)
    }
}

/// Map io errors onto the taxonomy where a specific kind exists.
pub fn classify_io(err: &std::io::Error) -> Option<EngineError> {
    use std::io::ErrorKind;

    match err.kind() {
        ErrorKind::PermissionDenied => Some(EngineError::PermissionDenied(err.to_string())),
        ErrorKind::StorageFull => Some(EngineError::DiskSpaceFull),
        _ => {
            // ENOSPC on platforms where StorageFull does not resolve, and the
            // Windows sharing violation (error 32) on rename
            match err.raw_os_error() {
                Some(28) if cfg!(unix) => Some(EngineError::DiskSpaceFull),
                Some(32) if cfg!(windows) => Some(EngineError::FileInUse(err.to_string())),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_engine_error_in_chain() {
        let err = anyhow::Error::from(EngineError::UnknownManifest).context("parsing pack");
        assert!(matches!(
            EngineError::classify(err),
            EngineError::UnknownManifest
        ));
    }

    #[test]
    fn classify_maps_permission_denied() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err = anyhow::Error::from(io).context("writing journal");
        assert!(matches!(
            EngineError::classify(err),
            EngineError::PermissionDenied(_)
        ));
    }

    #[test]
    fn classify_falls_back_to_unknown() {
        let err = anyhow::anyhow!("something nobody expected");
        let classified = EngineError::classify(err);
        assert!(matches!(classified, EngineError::Unknown(_)));
        assert_eq!(classified.exit_code(), 4);
    }

    #[test]
    fn exit_codes_follow_the_cli_contract() {
        assert_eq!(EngineError::CurseforgeUnauthorized.exit_code(), 1);
        assert_eq!(EngineError::RegistryNetwork("x".into()).exit_code(), 2);
        assert_eq!(EngineError::UnknownManifest.exit_code(), 3);
    }
}
