use std::path::PathBuf;
use std::time::Duration;

use crate::error::DispatchError;
use crate::job::EnvMode;

/// Execution timeout hint (seconds) carried in every job record.
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 60;

/// Retry hint carried in every job record.
pub const DEFAULT_RETRY_TIMES: u32 = 3;

/// Delay between two result-poll iterations.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Extension of the files pushed by `sys.rsync_module`.
pub const DEFAULT_MODULE_EXTENSION: &str = "py";

/// Dispatcher configuration.
///
/// Everything the dispatcher needs besides its collaborators: the shared
/// token used to seal `aes` envelopes, the execution hints stamped into each
/// record, and the local directories used for artifact staging.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Shared secret for the `aes` envelope mode.
    pub token: String,
    /// Envelope mode for submitted jobs.
    pub env: EnvMode,
    pub job_timeout_secs: u64,
    pub retry_times: u32,
    /// Local content-addressed cache for downloaded artifacts.
    pub cache_dir: PathBuf,
    /// Directory scanned by `sys.rsync_module`.
    pub module_dir: PathBuf,
    /// File extension (without the dot) selecting module files.
    pub module_extension: String,
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            env: EnvMode::Clear,
            job_timeout_secs: DEFAULT_JOB_TIMEOUT_SECS,
            retry_times: DEFAULT_RETRY_TIMES,
            cache_dir: PathBuf::from("var/cache"),
            module_dir: PathBuf::from("module"),
            module_extension: DEFAULT_MODULE_EXTENSION.to_string(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl DispatchConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Default::default()
        }
    }

    /// Seal every submitted payload with `token`.
    pub fn with_aes(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self.env = EnvMode::Aes;
        self
    }

    /// Set the token without changing the envelope mode. Needed to read
    /// `aes` envelopes written by another dispatcher.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_module_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.module_dir = dir.into();
        self
    }

    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_job_hints(mut self, timeout_secs: u64, retry_times: u32) -> Self {
        self.job_timeout_secs = timeout_secs;
        self.retry_times = retry_times;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Check that the settings are usable together.
    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.env == EnvMode::Aes && self.token.is_empty() {
            return Err(DispatchError::Config(
                "aes envelope mode requires a non-empty token".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(DispatchError::Config(
                "poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert!(cfg.token.is_empty());
        assert_eq!(cfg.env, EnvMode::Clear);
        assert_eq!(cfg.job_timeout_secs, 60);
        assert_eq!(cfg.retry_times, 3);
        assert_eq!(cfg.module_extension, "py");
        assert_eq!(cfg.poll_interval(), Duration::from_millis(200));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn with_aes_switches_mode() {
        let cfg = DispatchConfig::new("/tmp/cache").with_aes("secret");
        assert_eq!(cfg.env, EnvMode::Aes);
        assert_eq!(cfg.token, "secret");
        assert_eq!(cfg.cache_dir, PathBuf::from("/tmp/cache"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn with_token_keeps_clear_mode() {
        let cfg = DispatchConfig::default().with_token("secret");
        assert_eq!(cfg.env, EnvMode::Clear);
        assert_eq!(cfg.token, "secret");
    }

    #[test]
    fn aes_without_token_is_rejected() {
        let cfg = DispatchConfig::default().with_aes("");
        assert!(matches!(cfg.validate(), Err(DispatchError::Config(_))));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = DispatchConfig::default().with_poll_interval_ms(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn job_hints_builder() {
        let cfg = DispatchConfig::default().with_job_hints(10, 0);
        assert_eq!(cfg.job_timeout_secs, 10);
        assert_eq!(cfg.retry_times, 0);
    }
}
