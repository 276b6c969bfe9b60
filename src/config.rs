/// Tunables of a shell session.
///
/// There is no configuration file; the binary fills this from its command
/// line and everything else uses [`ShellConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellConfig {
    /// Text written before every input line.
    pub prompt: String,
    /// Maximum number of background jobs tracked at once.
    pub job_capacity: usize,
    /// Upper bound, in bytes, of a token after variable expansion.
    pub max_token_len: usize,
    /// Upper bound, in bytes, of a job's display text.
    pub max_display_len: usize,
}

pub const DEFAULT_PROMPT: &str = "mysh$ ";
pub const DEFAULT_JOB_CAPACITY: usize = 100;
pub const DEFAULT_MAX_TOKEN_LEN: usize = 128;
pub const DEFAULT_MAX_DISPLAY_LEN: usize = 256;

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            job_capacity: DEFAULT_JOB_CAPACITY,
            max_token_len: DEFAULT_MAX_TOKEN_LEN,
            max_display_len: DEFAULT_MAX_DISPLAY_LEN,
        }
    }
}
