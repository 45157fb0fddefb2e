use serde::{Deserialize, Serialize};

use crate::{common::types::AnyResult, configs::*};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub voice: VoiceConfig,
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub session: Option<SessionConfig>,
}

impl Config {
    pub fn load() -> AnyResult<Self> {
        let config_path = if std::path::Path::new("config.toml").exists() {
            "config.toml"
        } else if std::path::Path::new("config.default.toml").exists() {
            "config.default.toml"
        } else {
            return Err("config.toml or config.default.toml not found".into());
        };

        eprintln!("Loading configuration from: {}", config_path);

        let config_str = std::fs::read_to_string(config_path)?;
        Self::parse(&config_str).map_err(|e| format!("{}: {}", config_path, e).into())
    }

    pub fn parse(config_str: &str) -> AnyResult<Self> {
        if config_str.trim().is_empty() {
            return Err("configuration is empty".into());
        }
        let config: Config = toml::from_str(config_str)?;
        config.voice.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let config = Config::parse(
            r#"
            [voice]
            buffer_length_ms = 200
            execution = "task"
            enable_encryption = false

            [logging]
            level = "debug"

            [logging.file]
            path = "logs/voice.log"
            max_lines = 500

            [session]
            guild_id = "41771983423143937"
            channel_id = "127121515262115840"
            user_id = "80351110224678912"
            session_id = "abc"
            token = "secret"
            endpoint = "eu-west1.discord.media:80"
            "#,
        )
        .unwrap();

        assert_eq!(config.voice.buffer_length_ms, 200);
        assert_eq!(config.voice.execution, crate::gateway::ExecutionStrategy::Task);
        assert!(!config.voice.enable_encryption);
        assert_eq!(config.logging.unwrap().file.unwrap().max_lines, 500);
        assert_eq!(config.session.unwrap().user_id.0, 80351110224678912);
    }

    #[test]
    fn empty_config_is_rejected() {
        assert!(Config::parse("   ").is_err());
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let config = Config::parse("[logging]\nlevel = \"warn\"\n").unwrap();
        assert_eq!(config.voice.frame_duration_ms, 20);
        assert!(config.session.is_none());
    }
}
