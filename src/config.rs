use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::ConfidenceTier;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub matching: MatchingPolicy,
    #[serde(default)]
    pub alerts: AlertPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

/// 数据库配置; 未配置 url 时使用进程内存储
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub slow_statement_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 20,
            acquire_timeout_secs: 10,
            slow_statement_secs: 5,
        }
    }
}

/// 评分权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub description: f64,
    pub value: f64,
    pub category: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            description: 0.5,
            value: 0.3,
            category: 0.2,
        }
    }
}

/// 匹配策略: 权重与阈值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingPolicy {
    pub weights: ScoringWeights,
    /// 低于该分数的候选直接丢弃
    pub min_score: u8,
    pub medium_threshold: u8,
    /// 达到该分数可自动应用
    pub high_threshold: u8,
    /// 自动分类时是否直接应用高置信度建议
    pub auto_apply_high_confidence: bool,
}

impl Default for MatchingPolicy {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            min_score: 60,
            medium_threshold: 70,
            high_threshold: 85,
            auto_apply_high_confidence: true,
        }
    }
}

impl MatchingPolicy {
    pub fn tier(&self, score: u8) -> Option<ConfidenceTier> {
        if score >= self.high_threshold {
            Some(ConfidenceTier::High)
        } else if score >= self.medium_threshold {
            Some(ConfidenceTier::Medium)
        } else if score >= self.min_score {
            Some(ConfidenceTier::Low)
        } else {
            None
        }
    }
}

/// 告警策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertPolicy {
    pub variance_threshold_percent: f64,
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self {
            variance_threshold_percent: 20.0,
        }
    }
}

impl AppConfig {
    /// 加载配置: 默认值 → 配置文件 → `RECONCILER__*` 环境变量 → 兼容旧环境变量
    pub fn from_env() -> Result<Self> {
        let path = std::env::var("RECONCILER_CONFIG").unwrap_or_else(|_| "reconciler.toml".to_string());

        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("RECONCILER")
                    .prefix_separator("__")
                    .separator("__"),
            );

        if let Ok(url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }
        if let Ok(host) = std::env::var("SERVER_HOST") {
            builder = builder.set_override("server.host", host)?;
        }
        if let Ok(port) = std::env::var("SERVER_PORT") {
            builder = builder.set_override("server.port", port)?;
        }

        let config: AppConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_thresholds() {
        let policy = MatchingPolicy::default();
        assert_eq!(policy.weights, ScoringWeights { description: 0.5, value: 0.3, category: 0.2 });
        assert_eq!(policy.tier(85), Some(ConfidenceTier::High));
        assert_eq!(policy.tier(84), Some(ConfidenceTier::Medium));
        assert_eq!(policy.tier(70), Some(ConfidenceTier::Medium));
        assert_eq!(policy.tier(69), Some(ConfidenceTier::Low));
        assert_eq!(policy.tier(60), Some(ConfidenceTier::Low));
        assert_eq!(policy.tier(59), None);
        assert_eq!(AlertPolicy::default().variance_threshold_percent, 20.0);
    }

    #[test]
    fn partial_sections_fall_back_to_defaults() {
        let cfg: AppConfig = serde_json::from_str(r#"{"matching": {"high_threshold": 90}}"#).unwrap();
        assert_eq!(cfg.matching.high_threshold, 90);
        assert_eq!(cfg.matching.min_score, 60);
        assert_eq!(cfg.server.port, 8080);
        assert!(cfg.database.url.is_none());
    }
}
