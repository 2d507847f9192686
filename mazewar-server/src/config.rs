//! Maze template configuration.
//!
//! The server ships a built-in template and optionally loads a replacement
//! from a JSON file, so new mazes can be tried without rebuilding.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// The built-in maze, 8 rows by 30 columns.
pub const DEFAULT_TEMPLATE: [&str; 8] = [
    "******************************",
    "***** %%%%%%%%% &&&&&&&&&&& **",
    "***** %%%%%%%%%        $$$$  *",
    "*           $$$$$$ $$$$$$$$$ *",
    "*##########                  *",
    "*########## @@@@@@@@@@@@@@@@@*",
    "*           @@@@@@@@@@@@@@@@@*",
    "******************************",
];

/// On-disk template format: `{"template": ["...", ...]}` with rows of equal
/// length.
#[derive(Deserialize)]
struct MazeTemplateFile {
    template: Vec<String>,
}

/// Bootstrap failures around the template file. These are fatal, the
/// process exits with status 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read maze template file: {0}")]
    Read(#[from] std::io::Error),
    #[error("failed to parse maze template file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Returns the template rows: the file's rows when a path is given, the
/// built-in maze otherwise. Rectangularity is checked by the maze itself.
pub async fn load_template(path: Option<&Path>) -> Result<Vec<String>, ConfigError> {
    match path {
        None => Ok(DEFAULT_TEMPLATE.iter().map(|row| row.to_string()).collect()),
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            let file: MazeTemplateFile = serde_json::from_str(&text)?;
            Ok(file.template)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maze::Maze;

    #[tokio::test]
    async fn default_template_is_returned_without_a_path() {
        let template = load_template(None).await.unwrap();
        assert_eq!(template.len(), 8);
        assert!(Maze::new(&template).is_ok());
    }

    #[tokio::test]
    async fn template_file_is_parsed() {
        let dir = std::env::temp_dir().join("mazewar-config-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("maze.json");
        tokio::fs::write(&path, r#"{"template": ["***", "* *", "***"]}"#)
            .await
            .unwrap();

        let template = load_template(Some(&path)).await.unwrap();
        assert_eq!(template, vec!["***", "* *", "***"]);
    }

    #[tokio::test]
    async fn malformed_template_file_is_a_config_error() {
        let dir = std::env::temp_dir().join("mazewar-config-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("broken.json");
        tokio::fs::write(&path, "not json").await.unwrap();

        assert!(matches!(
            load_template(Some(&path)).await,
            Err(ConfigError::Parse(_))
        ));

        assert!(matches!(
            load_template(Some(Path::new("/nonexistent/maze.json"))).await,
            Err(ConfigError::Read(_))
        ));
    }
}
