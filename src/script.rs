//! Resolving a command token to a script file or an inline command.

use std::fmt;
use std::path::{Path, PathBuf};

/// What a single command token turned out to be. Exactly one source per token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSource {
    /// A local script file whose contents are run on the instance.
    Script(PathBuf),
    /// A literal shell command.
    Inline(String),
}

impl fmt::Display for CommandSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandSource::Script(path) => write!(f, "{}", path.display()),
            CommandSource::Inline(command) => write!(f, "{}", command),
        }
    }
}

/// Directories searched for script files, in priority order.
#[derive(Debug, Clone)]
pub struct ScriptLookup {
    /// The invoking process's working directory.
    pub cwd: PathBuf,
    /// `<config>/scripts`.
    pub user_dir: PathBuf,
    /// Scripts shipped with nimbus.
    pub bundled_dir: PathBuf,
}

impl ScriptLookup {
    pub fn new(cwd: PathBuf, config_dir: &Path, bundled_dir: PathBuf) -> Self {
        Self {
            cwd,
            user_dir: config_dir.join("scripts"),
            bundled_dir,
        }
    }

    /// First match wins: absolute path, working directory, user scripts, bundled
    /// scripts, and finally the token itself as an inline command.
    pub fn resolve(&self, token: &str) -> CommandSource {
        let candidates: Vec<PathBuf> = if Path::new(token).is_absolute() {
            vec![PathBuf::from(token)]
        } else {
            [&self.cwd, &self.user_dir, &self.bundled_dir]
                .iter()
                .map(|dir| dir.join(token))
                .collect()
        };

        candidates
            .into_iter()
            .find(|path| path.is_file())
            .map(CommandSource::Script)
            .unwrap_or_else(|| CommandSource::Inline(token.to_string()))
    }
}
