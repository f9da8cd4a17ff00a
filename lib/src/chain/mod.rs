//! Test scenarios: ordered request/response exchanges through the system
//! under test, declared in code or loaded from JSON and TOML files.

pub mod filter;
pub mod stock;

use std::{fmt, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::message::{HeaderList, Message, StartLine, Version};

pub use crate::chain::filter::{filter_by_name, ConditionalCache, Filter, FilterError};

/// One exchange: what the client sends and gets back, and what the origin
/// receives and answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageChain {
    pub request: Message,
    /// `None` when no response may reach the client
    pub response: Option<Message>,
    /// request expected at the origin, `None` when it must not be forwarded
    pub forwarded_request: Option<Message>,
    /// what the origin answers to the forwarded request
    pub server_response: Option<Message>,
}

impl MessageChain {
    pub fn new(request: Message, response: Option<Message>) -> Self {
        MessageChain {
            request,
            response,
            forwarded_request: None,
            server_response: None,
        }
    }

    pub fn forwarded(mut self, forwarded_request: Message, server_response: Message) -> Self {
        self.forwarded_request = Some(forwarded_request);
        self.server_response = Some(server_response);
        self
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded_request.is_some()
    }
}

#[derive(Debug, Default)]
pub struct Chain {
    pub steps: Vec<MessageChain>,
    pub filters: Vec<Box<dyn Filter>>,
}

impl Chain {
    pub fn from_steps(steps: Vec<MessageChain>) -> Self {
        Chain {
            steps,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn Filter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The step with every filter applied, in declaration order. The
    /// declared step is left untouched.
    pub fn prepared_step(&self, index: usize) -> Option<Result<MessageChain, FilterError>> {
        let mut step = self.steps.get(index)?.clone();
        for filter in &self.filters {
            if let Err(e) = filter.apply(&mut step) {
                return Some(Err(e));
            }
        }
        Some(Ok(step))
    }

    /// expected client response of a step, after filtering
    pub fn expected_response(&self, index: usize) -> Option<Result<Option<Message>, FilterError>> {
        self.prepared_step(index)
            .map(|step| step.map(|step| step.response))
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeclarationError {
    #[error("could not read scenario file {path}: {error}")]
    FileRead { path: String, error: std::io::Error },
    #[error("invalid JSON scenario: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid TOML scenario: {0}")]
    Toml(#[from] Box<toml::de::Error>),
    #[error("unknown filter '{0}'")]
    UnknownFilter(String),
    #[error("message {0} declares both a method and a status")]
    Ambiguous(String),
    #[error("message {0} declares neither a method nor a status")]
    Incomplete(String),
}

/// Serialized form of a message. Requests have a `method`, responses a
/// `status`. HTTP/2 pseudo-headers are declared as ordinary headers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageDeclaration {
    pub method: Option<String>,
    pub uri: Option<String>,
    pub status: Option<u16>,
    /// defaults to the standard phrase of the status
    pub reason: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub trailers: Vec<(String, String)>,
    /// add a `Content-Length` matching the body
    #[serde(default)]
    pub content_length: bool,
}

impl MessageDeclaration {
    pub fn into_message(self) -> Result<Message, DeclarationError> {
        let description = format!(
            "{} {}",
            self.method.as_deref().unwrap_or_default(),
            self.uri.as_deref().unwrap_or_default()
        );
        let mut message = match (self.method, self.status) {
            (Some(_), Some(_)) => return Err(DeclarationError::Ambiguous(description)),
            (None, None) => return Err(DeclarationError::Incomplete(description)),
            (Some(method), None) => Message::request(method, self.uri.unwrap_or_else(|| "/".to_owned())),
            (None, Some(status)) => {
                let mut response = Message::response(status);
                if let Some(reason) = self.reason {
                    response.start = StartLine::Response {
                        status,
                        reason: Some(reason),
                    };
                }
                response
            }
        };
        if let Some(version) = self.version {
            message.version = Version::from_token(&version);
        }
        message.headers = self.headers.into_iter().collect::<HeaderList>();
        message.trailers = self.trailers.into_iter().collect::<HeaderList>();
        message.body = self.body.into_bytes();
        if self.content_length {
            message = message.with_content_length();
        }
        Ok(message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDeclaration {
    pub request: MessageDeclaration,
    pub response: Option<MessageDeclaration>,
    pub forwarded_request: Option<MessageDeclaration>,
    pub server_response: Option<MessageDeclaration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainDeclaration {
    #[serde(default)]
    pub filters: Vec<String>,
    pub steps: Vec<StepDeclaration>,
}

impl ChainDeclaration {
    pub fn from_json(data: &str) -> Result<Self, DeclarationError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_toml(data: &str) -> Result<Self, DeclarationError> {
        toml::from_str(data).map_err(|e| DeclarationError::Toml(Box::new(e)))
    }

    /// Load a `.json` file, anything else is read as TOML
    pub fn load_from_path(path: &Path) -> Result<Self, DeclarationError> {
        let data = fs::read_to_string(path).map_err(|error| DeclarationError::FileRead {
            path: path.display().to_string(),
            error,
        })?;
        match path.extension().and_then(|extension| extension.to_str()) {
            Some("json") => ChainDeclaration::from_json(&data),
            _ => ChainDeclaration::from_toml(&data),
        }
    }

    pub fn into_chain(self) -> Result<Chain, DeclarationError> {
        let mut chain = Chain::default();
        for name in self.filters {
            let filter =
                filter_by_name(&name).ok_or_else(|| DeclarationError::UnknownFilter(name.clone()))?;
            chain.filters.push(filter);
        }
        for step in self.steps {
            chain.steps.push(MessageChain {
                request: step.request.into_message()?,
                response: step.response.map(MessageDeclaration::into_message).transpose()?,
                forwarded_request: step
                    .forwarded_request
                    .map(MessageDeclaration::into_message)
                    .transpose()?,
                server_response: step
                    .server_response
                    .map(MessageDeclaration::into_message)
                    .transpose()?,
            });
        }
        Ok(chain)
    }
}

impl fmt::Display for MessageChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.request)?;
        if let Some(response) = &self.response {
            write!(f, " -> {response}")?;
        }
        Ok(())
    }
}
