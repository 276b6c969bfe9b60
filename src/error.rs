use thiserror::Error;

/// Failures the interpreter reports to the user.
///
/// Each variant is rendered as a single diagnostic line; none of them ends
/// the session.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Wrong argument count or an unparsable argument.
    #[error("{0}")]
    Usage(String),
    /// A process or channel could not be created.
    #[error("{what}: {source}")]
    Resource {
        what: &'static str,
        #[source]
        source: nix::Error,
    },
    /// No builtin and no external program carries this name.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
    /// The job table is full.
    #[error("Too many background processes")]
    Capacity,
}

/// Construction errors of the pipeline builder.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Empty command in pipeline at segment {index}")]
    EmptySegment { index: usize },
    #[error("Empty command line")]
    Empty,
}
