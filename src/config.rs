//! Startup configuration.
//!
//! A [`RagConfig`] is resolved exactly once, before any turn runs, and is then
//! passed by reference to the adapter constructors.  Sources are layered, each
//! overriding the previous one:
//!
//! 1. built-in defaults ([`RagConfig::new`]),
//! 2. an optional YAML file (`--config FILE` or `RAGCHAT_CONFIG`),
//! 3. the process environment,
//! 4. command-line flags ([`RagArgs`]).
//!
//! [`RagConfig::validate`] then fails fast on anything missing.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use arrrg_derive::CommandLine;
use serde::Deserialize;
use url::Url;

use crate::error::{Error, Result};
use crate::prompt::{DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_USER_TEMPLATE, PromptTemplate};
use crate::retry::RetryPolicy;
use crate::session::SessionLimits;

/// Default OpenAI-compatible API root.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1/";
/// Default chat model.
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";
/// Default Pinecone control-plane root.
pub const DEFAULT_PINECONE_CONTROL_URL: &str = "https://api.pinecone.io/";
/// Default hosted embedding model.
pub const DEFAULT_EMBEDDING_MODEL: &str = "multilingual-e5-large";
/// Default metadata field holding fragment text.
pub const DEFAULT_TEXT_KEY: &str = "body";
/// Default number of fragments retrieved per turn.
pub const DEFAULT_TOP_K: usize = 5;
/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
/// Default number of retries per provider call.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Environment variable naming a YAML configuration file.
pub const CONFIG_FILE_ENV: &str = "RAGCHAT_CONFIG";

/// Command-line arguments for the ragchat tool.
#[derive(CommandLine, Debug, Default, PartialEq, Eq)]
pub struct RagArgs {
    /// YAML configuration file.
    #[arrrg(optional, "YAML configuration file (default: $RAGCHAT_CONFIG)", "FILE")]
    pub config: Option<String>,

    /// Session to talk in.
    #[arrrg(optional, "Session id to use (default: console)", "ID")]
    pub session: Option<String>,

    /// Chat model.
    #[arrrg(optional, "Chat model (default: gpt-4o-mini)", "MODEL")]
    pub model: Option<String>,

    /// Pinecone index.
    #[arrrg(optional, "Pinecone index name (default: $PINECONE_INDEX)", "INDEX")]
    pub index: Option<String>,

    /// Fragments retrieved per turn.
    #[arrrg(optional, "Fragments retrieved per turn (default: 5)", "N")]
    pub top_k: Option<u32>,

    /// Disable ANSI colors and styles.
    #[arrrg(flag, "Disable ANSI colors/styles")]
    pub no_color: bool,

    /// Log pipeline activity to stderr.
    #[arrrg(flag, "Log pipeline activity to stderr")]
    pub verbose: bool,
}

/// Resolved configuration for the pipeline and its adapters.
#[derive(Clone, PartialEq)]
pub struct RagConfig {
    /// Credential for the chat-completion provider.
    pub openai_api_key: Option<String>,
    /// Root of the OpenAI-compatible API.
    pub openai_base_url: String,
    /// Model asked for replies.
    pub chat_model: String,
    /// Optional sampling temperature.
    pub temperature: Option<f32>,
    /// Optional cap on reply tokens.
    pub max_tokens: Option<u32>,

    /// Credential for the vector-search provider.
    pub pinecone_api_key: Option<String>,
    /// Root of the Pinecone control plane and inference API.
    pub pinecone_control_url: String,
    /// Name of the pre-built index.
    pub index_name: Option<String>,
    /// Data-plane host of the index; looked up from the name when absent.
    pub index_host: Option<String>,
    /// Index namespace; empty is the default namespace.
    pub namespace: String,
    /// Hosted model used to embed queries.
    pub embedding_model: String,
    /// Metadata field that holds each record's text.
    pub text_key: String,

    /// Fragments retrieved per turn.
    pub top_k: usize,
    /// System instruction for every prompt.
    pub system_instruction: String,
    /// Template for the final user turn.
    pub user_template: String,

    /// Deadline for each HTTP request.
    pub request_timeout: Duration,
    /// Re-attempts for transient provider failures.
    pub max_retries: u32,

    /// Cap on live sessions.
    pub max_sessions: Option<usize>,
    /// Idle time after which a session is dropped.
    pub session_idle_ttl: Option<Duration>,
}

impl fmt::Debug for RagConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn redact(secret: &Option<String>) -> &'static str {
            if secret.is_some() { "<redacted>" } else { "<unset>" }
        }
        f.debug_struct("RagConfig")
            .field("openai_api_key", &redact(&self.openai_api_key))
            .field("openai_base_url", &self.openai_base_url)
            .field("chat_model", &self.chat_model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("pinecone_api_key", &redact(&self.pinecone_api_key))
            .field("pinecone_control_url", &self.pinecone_control_url)
            .field("index_name", &self.index_name)
            .field("index_host", &self.index_host)
            .field("namespace", &self.namespace)
            .field("embedding_model", &self.embedding_model)
            .field("text_key", &self.text_key)
            .field("top_k", &self.top_k)
            .field("system_instruction", &self.system_instruction)
            .field("user_template", &self.user_template)
            .field("request_timeout", &self.request_timeout)
            .field("max_retries", &self.max_retries)
            .field("max_sessions", &self.max_sessions)
            .field("session_idle_ttl", &self.session_idle_ttl)
            .finish()
    }
}

/// On-disk shape of the YAML configuration file.  Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    openai_api_key: Option<String>,
    openai_base_url: Option<String>,
    chat_model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    pinecone_api_key: Option<String>,
    pinecone_control_url: Option<String>,
    index_name: Option<String>,
    index_host: Option<String>,
    namespace: Option<String>,
    embedding_model: Option<String>,
    text_key: Option<String>,
    top_k: Option<usize>,
    system_instruction: Option<String>,
    user_template: Option<String>,
    request_timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    max_sessions: Option<usize>,
    session_idle_ttl_secs: Option<u64>,
}

impl RagConfig {
    /// Creates a configuration holding only the built-in defaults.
    ///
    /// No credentials are set; the environment is not consulted.
    pub fn new() -> Self {
        Self {
            openai_api_key: None,
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
            pinecone_api_key: None,
            pinecone_control_url: DEFAULT_PINECONE_CONTROL_URL.to_string(),
            index_name: None,
            index_host: None,
            namespace: String::new(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            text_key: DEFAULT_TEXT_KEY.to_string(),
            top_k: DEFAULT_TOP_K,
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            max_sessions: None,
            session_idle_ttl: None,
        }
    }

    /// Resolves the configuration from every source and validates it.
    pub fn load(args: &RagArgs) -> Result<Self> {
        Self::load_with(args, |key| std::env::var(key).ok())
    }

    /// Like [`RagConfig::load`], reading the environment through `env`.
    pub fn load_with<F>(args: &RagArgs, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();
        let file = args.config.clone().or_else(|| env(CONFIG_FILE_ENV));
        if let Some(file) = file {
            config = config.merge_file(&file)?;
        }
        config = config.apply_env(&env).apply_args(args);
        config.validate()?;
        Ok(config)
    }

    /// Overlays values from the YAML file at `path`.
    pub fn merge_file<P: AsRef<Path>>(self, path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::io(
                format!("failed to read configuration file {}", path.display()),
                err,
            )
        })?;
        self.merge_yaml(&text)
    }

    /// Overlays values from YAML text.
    pub fn merge_yaml(mut self, text: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(text).map_err(|err| {
            Error::configuration(format!("invalid configuration file: {err}"), None)
        })?;
        let ConfigFile {
            openai_api_key,
            openai_base_url,
            chat_model,
            temperature,
            max_tokens,
            pinecone_api_key,
            pinecone_control_url,
            index_name,
            index_host,
            namespace,
            embedding_model,
            text_key,
            top_k,
            system_instruction,
            user_template,
            request_timeout_secs,
            max_retries,
            max_sessions,
            session_idle_ttl_secs,
        } = file;

        self.openai_api_key = openai_api_key.or(self.openai_api_key);
        self.openai_base_url = openai_base_url.unwrap_or(self.openai_base_url);
        self.chat_model = chat_model.unwrap_or(self.chat_model);
        self.temperature = temperature.or(self.temperature);
        self.max_tokens = max_tokens.or(self.max_tokens);
        self.pinecone_api_key = pinecone_api_key.or(self.pinecone_api_key);
        self.pinecone_control_url = pinecone_control_url.unwrap_or(self.pinecone_control_url);
        self.index_name = index_name.or(self.index_name);
        self.index_host = index_host.or(self.index_host);
        self.namespace = namespace.unwrap_or(self.namespace);
        self.embedding_model = embedding_model.unwrap_or(self.embedding_model);
        self.text_key = text_key.unwrap_or(self.text_key);
        self.top_k = top_k.unwrap_or(self.top_k);
        self.system_instruction = system_instruction.unwrap_or(self.system_instruction);
        self.user_template = user_template.unwrap_or(self.user_template);
        self.max_retries = max_retries.unwrap_or(self.max_retries);
        self.max_sessions = max_sessions.or(self.max_sessions);
        if let Some(secs) = request_timeout_secs {
            self.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = session_idle_ttl_secs {
            self.session_idle_ttl = Some(Duration::from_secs(secs));
        }
        Ok(self)
    }

    /// Overlays values from environment variables, read through `env`.
    ///
    /// Empty variables are treated as unset.
    pub fn apply_env<F>(mut self, env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| env(key).filter(|value| !value.trim().is_empty());
        if let Some(key) = var("OPENAI_API_KEY") {
            self.openai_api_key = Some(key);
        }
        if let Some(url) = var("OPENAI_BASE_URL") {
            self.openai_base_url = url;
        }
        if let Some(model) = var("RAGCHAT_CHAT_MODEL") {
            self.chat_model = model;
        }
        if let Some(key) = var("PINECONE_API_KEY") {
            self.pinecone_api_key = Some(key);
        }
        if let Some(index) = var("PINECONE_INDEX") {
            self.index_name = Some(index);
        }
        if let Some(host) = var("PINECONE_INDEX_HOST") {
            self.index_host = Some(host);
        }
        if let Some(model) = var("PINECONE_EMBEDDING_MODEL") {
            self.embedding_model = model;
        }
        self
    }

    /// Overlays values given on the command line.
    pub fn apply_args(mut self, args: &RagArgs) -> Self {
        if let Some(model) = &args.model {
            self.chat_model = model.clone();
        }
        if let Some(index) = &args.index {
            self.index_name = Some(index.clone());
        }
        if let Some(top_k) = args.top_k {
            self.top_k = top_k as usize;
        }
        self
    }

    /// Checks that everything a turn needs is present and well formed.
    pub fn validate(&self) -> Result<()> {
        fn require(value: &Option<String>, message: &str, field: &str) -> Result<()> {
            match value {
                Some(value) if !value.trim().is_empty() => Ok(()),
                _ => Err(Error::configuration(message, Some(field.to_string()))),
            }
        }
        fn parse_url(value: &str, field: &str) -> Result<()> {
            Url::parse(value).map(|_| ()).map_err(|err| {
                Error::configuration(
                    format!("{value:?} is not a valid URL: {err}"),
                    Some(field.to_string()),
                )
            })
        }

        require(
            &self.openai_api_key,
            "OpenAI API key not provided and OPENAI_API_KEY not set",
            "openai_api_key",
        )?;
        require(
            &self.pinecone_api_key,
            "Pinecone API key not provided and PINECONE_API_KEY not set",
            "pinecone_api_key",
        )?;
        require(
            &self.index_name,
            "Pinecone index not provided and PINECONE_INDEX not set",
            "index_name",
        )?;
        parse_url(&self.openai_base_url, "openai_base_url")?;
        parse_url(&self.pinecone_control_url, "pinecone_control_url")?;
        if self.chat_model.trim().is_empty() {
            return Err(Error::configuration(
                "chat model must not be empty",
                Some("chat_model".to_string()),
            ));
        }
        if self.top_k == 0 {
            return Err(Error::configuration(
                "top_k must be at least 1",
                Some("top_k".to_string()),
            ));
        }
        if self.max_sessions == Some(0) {
            return Err(Error::configuration(
                "max_sessions must be at least 1",
                Some("max_sessions".to_string()),
            ));
        }
        Ok(())
    }

    /// Sets the OpenAI API key.
    pub fn with_openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    /// Sets the chat model.
    pub fn with_chat_model(mut self, model: impl Into<String>) -> Self {
        self.chat_model = model.into();
        self
    }

    /// Sets the Pinecone API key.
    pub fn with_pinecone_api_key(mut self, key: impl Into<String>) -> Self {
        self.pinecone_api_key = Some(key.into());
        self
    }

    /// Sets the index name.
    pub fn with_index_name(mut self, index: impl Into<String>) -> Self {
        self.index_name = Some(index.into());
        self
    }

    /// Sets the index host.
    pub fn with_index_host(mut self, host: impl Into<String>) -> Self {
        self.index_host = Some(host.into());
        self
    }

    /// Sets the number of fragments retrieved per turn.
    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Sets the system instruction.
    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = instruction.into();
        self
    }

    /// The prompt template these settings describe.
    pub fn prompt_template(&self) -> PromptTemplate {
        PromptTemplate::new()
            .with_system_instruction(self.system_instruction.clone())
            .with_user_template(self.user_template.clone())
    }

    /// The retry policy these settings describe.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.max_retries)
            .with_attempt_timeout(Some(self.request_timeout))
    }

    /// The session limits these settings describe.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits::unbounded()
            .with_max_sessions(self.max_sessions)
            .with_idle_ttl(self.session_idle_ttl)
    }
}

impl Default for RagConfig {
    fn default() -> Self {
        Self::new()
    }
}
