use std::collections::BTreeSet;

use crate::models::CredentialEntry;

/** \brief 内置默认凭据的固定 ID。 */
pub const DEFAULT_ENTRY_ID: &str = "default";

/** \brief 编译期注入的默认密钥（构建时设置 STORYLOOM_DEFAULT_API_KEY）。 */
pub const BUILD_DEFAULT_SECRET: Option<&str> = option_env!("STORYLOOM_DEFAULT_API_KEY");

/**
 * \brief 凭据的调用路径。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<'a> {
    /** \brief 原生厂商接口 */
    Native,
    /** \brief OpenAI 兼容接口 */
    Generic { endpoint: &'a str, model: &'a str },
    /** \brief endpoint/model 只配置了一半，不可用 */
    Incomplete,
}

impl CredentialEntry {
    /**
     * \brief 创建普通凭据，默认启用全部密钥。
     */
    pub fn new(id: impl Into<String>, name: impl Into<String>, keys: Vec<String>) -> Self {
        let active_indexes = (0..keys.len()).collect();
        Self {
            id: id.into(),
            name: name.into(),
            keys,
            active_indexes,
            endpoint: None,
            model_id: None,
            is_default: false,
        }
    }

    /**
     * \brief 内置默认凭据，占位密钥由 SecretResolver 替换。
     */
    pub fn synthetic_default() -> Self {
        Self {
            id: DEFAULT_ENTRY_ID.to_string(),
            name: "Default key".to_string(),
            keys: vec![String::new()],
            active_indexes: BTreeSet::from([0]),
            endpoint: None,
            model_id: None,
            is_default: true,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>, model_id: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self.model_id = Some(model_id.into());
        self
    }

    /**
     * \brief 判定调用路径；空字符串按未设置处理。
     */
    pub fn route(&self) -> Route<'_> {
        let endpoint = self.endpoint.as_deref().map(str::trim).filter(|s| !s.is_empty());
        let model = self.model_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
        match (endpoint, model) {
            (Some(endpoint), Some(model)) => Route::Generic { endpoint, model },
            (None, None) => Route::Native,
            _ => Route::Incomplete,
        }
    }

    /**
     * \brief 第一个启用且存在的密钥（按下标升序）。
     */
    pub fn first_active_secret(&self) -> Option<(usize, &str)> {
        self.active_indexes
            .iter()
            .find_map(|&i| self.keys.get(i).map(|k| (i, k.as_str())))
    }

    /**
     * \brief 切换指定密钥的启用状态，返回切换后的状态。
     */
    pub fn toggle_key(&mut self, index: usize) -> Option<bool> {
        if index >= self.keys.len() {
            return None;
        }
        if self.active_indexes.remove(&index) {
            Some(false)
        } else {
            self.active_indexes.insert(index);
            Some(true)
        }
    }

    /**
     * \brief 丢弃越界的启用下标（编辑 keys 之后调用）。
     */
    pub fn normalize(&mut self) {
        let len = self.keys.len();
        self.active_indexes.retain(|&i| i < len);
    }

    /**
     * \brief 用于展示的副本，密钥全部遮蔽。
     */
    pub fn masked(&self) -> Self {
        let mut view = self.clone();
        view.keys = self.keys.iter().map(|k| mask_secret(k)).collect();
        view
    }
}

/**
 * \brief 生成新凭据 ID（秒级时间戳加随机后缀）。
 */
pub fn new_entry_id() -> String {
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    format!("key-{}-{:04x}", now, rand::random::<u16>())
}

/**
 * \brief 生成实际参与轮询的凭据列表：按需在最前面插入默认凭据。
 */
pub fn effective_key_list(pool: &[CredentialEntry], use_default: bool) -> Vec<CredentialEntry> {
    let mut list = Vec::with_capacity(pool.len() + 1);
    if use_default {
        list.push(CredentialEntry::synthetic_default());
    }
    list.extend(pool.iter().filter(|e| !e.is_default).cloned());
    list
}

/**
 * \brief 解析一次粘贴的多把密钥：逗号、空白、换行分隔，去重保序。
 */
pub fn parse_raw_keys(raw: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

/**
 * \brief 为展示用途遮蔽密钥，只保留末四位。
 */
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "****".to_string();
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("****{}", tail)
}

/**
 * \brief 密钥解析策略：将条目与原始值映射为实际使用的密钥。
 * \details 返回空字符串表示该凭据不可用，应跳过。
 */
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, entry: &CredentialEntry, raw: &str) -> String;
}

/**
 * \brief 默认策略：默认凭据使用共享密钥，其余直接使用原始值。
 */
#[derive(Debug, Clone, Default)]
pub struct DefaultSecretResolver {
    shared: Option<String>,
}

impl DefaultSecretResolver {
    /**
     * \brief 运行期覆盖优先，其次使用编译期注入值。
     */
    pub fn new(runtime_override: Option<String>) -> Self {
        let shared = runtime_override
            .filter(|s| !s.trim().is_empty())
            .or_else(|| BUILD_DEFAULT_SECRET.map(str::to_string));
        Self { shared }
    }

    pub fn has_shared_secret(&self) -> bool {
        self.shared.as_deref().is_some_and(|s| !s.trim().is_empty())
    }
}

impl SecretResolver for DefaultSecretResolver {
    fn resolve(&self, entry: &CredentialEntry, raw: &str) -> String {
        if entry.is_default {
            self.shared.clone().unwrap_or_default()
        } else {
            raw.trim().to_string()
        }
    }
}

impl<F> SecretResolver for F
where
    F: Fn(&CredentialEntry, &str) -> String + Send + Sync,
{
    fn resolve(&self, entry: &CredentialEntry, raw: &str) -> String {
        self(entry, raw)
    }
}
