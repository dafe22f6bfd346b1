use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/**
 * \brief 凭据条目：一个 Provider 配置，可包含多把 API Key。
 * \details 序列化字段采用 camelCase，与持久化的 JSON 数组格式保持一致。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEntry {
    /** \brief 唯一标识 */
    pub id: String,
    /** \brief 显示名称 */
    pub name: String,
    /** \brief 原始密钥列表（支持一次粘贴多把） */
    #[serde(default)]
    pub keys: Vec<String>,
    /** \brief 当前启用的密钥下标 */
    #[serde(default)]
    pub active_indexes: BTreeSet<usize>,
    /** \brief OpenAI 兼容接口的基地址；为空时视为原生厂商凭据 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /** \brief 配合 endpoint 使用的模型名 */
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /** \brief 是否为内置默认凭据（不落盘） */
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_default: bool,
}

/**
 * \brief 消息结构，与 OpenAI Chat 消息格式对齐。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /** \brief 角色：system/user/assistant */
    pub role: String,
    /** \brief 内容 */
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/**
 * \brief 改写范围。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteScope {
    EntireStory,
    SelectedChapter,
}

/**
 * \brief 生成模式：续写或改写。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "scope", rename_all = "snake_case")]
pub enum GenerationMode {
    Continue,
    Rewrite(RewriteScope),
}

/**
 * \brief 故事元信息。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: i64,
    pub title: String,
    /** \brief 创建时间（RFC 3339） */
    pub created_at: String,
}

/**
 * \brief 故事片段（章节），按 position 排序。
 */
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Segment {
    pub id: i64,
    pub story_id: i64,
    pub position: i64,
    pub content: String,
}

/**
 * \brief 故事角色设定。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub story_id: i64,
    pub name: String,
    pub description: String,
}

/**
 * \brief 创作方向：会被折叠进用户消息的若干小节。
 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreativeDirection {
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub point_of_view: Option<String>,
    /** \brief 自定义提示词 */
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub characters: Vec<Character>,
}
