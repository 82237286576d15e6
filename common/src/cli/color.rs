//! Colour policy for log output.
//!
//! An explicit `--color always|never` wins. In `auto`, `NO_COLOR` and `EMACS`
//! switch colours off, otherwise they follow whether the stream is a TTY.

use std::env;

/// When to emit ANSI colors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ColorWhen {
    /// Enable colors only when output is a TTY.
    #[default]
    Auto,

    /// Always enable colors.
    Always,

    /// Never enable colors.
    Never,
}

impl ColorWhen {
    // ---
    /// Returns whether ANSI color should be used for the given stream.
    pub fn should_color(self, stream: atty::Stream) -> bool {
        // ---
        match self {
            ColorWhen::Always => true,
            ColorWhen::Never => false,
            ColorWhen::Auto => !env_disables_color() && atty::is(stream),
        }
    }

    /// Log output goes to stderr.
    pub fn should_color_stderr(self) -> bool {
        // ---
        self.should_color(atty::Stream::Stderr)
    }
}

fn env_disables_color() -> bool {
    // ---
    ["NO_COLOR", "EMACS"]
        .iter()
        .any(|key| env::var_os(key).is_some())
}
