use rand::Rng;
use std::path::PathBuf;

/// A fresh socket path in the temp directory.
///
/// The file is not created; whoever binds the path owns it.
pub fn pipe_name() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("sluice-{}-{:016x}.sock", std::process::id(), suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_names_are_unique() {
        let a = pipe_name();
        let b = pipe_name();

        assert_ne!(a, b);
        assert!(a.starts_with(std::env::temp_dir()));
        assert_eq!(a.extension().and_then(|e| e.to_str()), Some("sock"));
        assert!(!a.exists());
    }
}
