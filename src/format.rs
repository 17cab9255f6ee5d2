use anyhow::{Context as _, Result};
use clap::ValueEnum;
use serde::Serialize;
use std::fmt::Display;

/// Output format for reports and records printed on stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Plain text for humans
    #[default]
    Text,
    /// JSON - machine-parseable
    Json,
}

impl OutputFormat {
    /// Render `data` as text (its `Display`) or pretty JSON.
    pub fn render<T: Serialize + Display>(self, data: &T) -> Result<String> {
        match self {
            Self::Text => Ok(data.to_string()),
            Self::Json => serde_json::to_string_pretty(data).context("JSON serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        id: &'static str,
    }

    impl Display for Row {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "row {}", self.id)
        }
    }

    #[test]
    fn text_uses_display_and_json_serializes() {
        let row = Row { id: "a" };
        assert_eq!(OutputFormat::Text.render(&row).unwrap(), "row a");
        assert_eq!(
            OutputFormat::Json.render(&row).unwrap(),
            "{\n  \"id\": \"a\"\n}"
        );
    }
}
