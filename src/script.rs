//! Where the user script served at `/script.js` comes from.

use std::path::{Path, PathBuf};

/// Why a script could not be loaded.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("could not read script {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("script {0} is not valid UTF-8")]
    Encoding(PathBuf),
}

/// Supplies the text of the user script.
pub trait ScriptSource: std::fmt::Debug {
    fn load(&self) -> Result<String, Error>;
}

/// A script read from disk.
#[derive(Debug, Clone)]
pub struct FileScript {
    path: PathBuf,
}

impl FileScript {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileScript { path: path.into() }
    }

    /// Where the script is read from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScriptSource for FileScript {
    fn load(&self) -> Result<String, Error> {
        let bytes = std::fs::read(&self.path).map_err(|source| Error::Read {
            path: self.path.clone(),
            source,
        })?;
        String::from_utf8(bytes).map_err(|_| Error::Encoding(self.path.clone()))
    }
}

/// A script held in memory.
///
/// ```
/// use autohook::script::{InlineScript, ScriptSource};
/// let s = InlineScript::new("export default 1;");
/// assert_eq!(s.load().unwrap(), "export default 1;");
/// ```
#[derive(Debug, Clone)]
pub struct InlineScript(String);

impl InlineScript {
    pub fn new(text: impl Into<String>) -> Self {
        InlineScript(text.into())
    }
}

impl ScriptSource for InlineScript {
    fn load(&self) -> Result<String, Error> {
        Ok(self.0.clone())
    }
}
