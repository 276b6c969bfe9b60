//! Splitting a command line into pipeline stages and allocating the
//! channels between them.

use crate::builtin::Registry;
use crate::command::CommandFactory;
use crate::error::{PipelineError, ShellError};
use crate::lexer::PIPE;
use nix::unistd::pipe;
use std::os::fd::OwnedFd;

/// One command of a pipeline, resolved against the builtin registry.
pub enum Stage<'r> {
    /// Runs in-process in the stage's child.
    Builtin {
        handler: &'r dyn CommandFactory,
        argv: Vec<String>,
    },
    /// Replaces the stage's child with a program found in `PATH`.
    External { argv: Vec<String> },
}

impl<'r> Stage<'r> {
    pub fn resolve(argv: Vec<String>, registry: &'r Registry) -> Self {
        match registry.lookup(&argv[0]) {
            Some(handler) => Stage::Builtin { handler, argv },
            None => Stage::External { argv },
        }
    }

    pub fn argv(&self) -> &[String] {
        match self {
            Stage::Builtin { argv, .. } | Stage::External { argv } => argv,
        }
    }

    /// Command name, used in diagnostics.
    pub fn name(&self) -> &str {
        &self.argv()[0]
    }
}

/// Whether `tokens` contain a pipe separator.
pub fn has_pipe(tokens: &[String]) -> bool {
    tokens.iter().any(|t| t == PIPE)
}

/// Splits `tokens` at every pipe separator.
///
/// `k` separators give `k + 1` segments. Any empty segment (leading,
/// trailing or doubled separator) is an error.
pub fn split_segments(tokens: Vec<String>) -> Result<Vec<Vec<String>>, PipelineError> {
    if tokens.is_empty() {
        return Err(PipelineError::Empty);
    }
    let mut segments = vec![Vec::new()];
    for token in tokens {
        if token == PIPE {
            segments.push(Vec::new());
        } else if let Some(current) = segments.last_mut() {
            current.push(token);
        }
    }
    if let Some(index) = segments.iter().position(Vec::is_empty) {
        return Err(PipelineError::EmptySegment { index });
    }
    Ok(segments)
}

/// Validated stages of one command line, in textual order.
pub struct Pipeline<'r> {
    pub stages: Vec<Stage<'r>>,
}

impl<'r> Pipeline<'r> {
    pub fn build(tokens: Vec<String>, registry: &'r Registry) -> Result<Self, PipelineError> {
        let stages = split_segments(tokens)?
            .into_iter()
            .map(|argv| Stage::resolve(argv, registry))
            .collect();
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// A unidirectional byte channel from stage `i` to stage `i + 1`.
pub struct Channel {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Allocates `count` channels. Any failure releases those already made.
pub fn allocate_channels(count: usize) -> Result<Vec<Channel>, ShellError> {
    (0..count)
        .map(|_| {
            pipe()
                .map(|(read, write)| Channel { read, write })
                .map_err(|source| ShellError::Resource {
                    what: "pipe",
                    source,
                })
        })
        .collect()
}
