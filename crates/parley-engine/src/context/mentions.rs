use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parley_core::context::{Annotation, AnnotationKind};
use parley_core::messages::Attachment;
use parley_core::tools::{ToolCatalog, ToolDefinition};
use regex::Regex;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use tracing::{debug, warn};

use crate::agents::validate_agent_id;

static MENTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@(tools?|files?|prompts?|url)/(\S+)").expect("valid mention regex"));

const TRAILING_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', ')', ']', '}', '"', '\''];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MentionKind {
    Tool,
    File,
    Prompt,
    Url,
}

impl MentionKind {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "tool" | "tools" => Some(Self::Tool),
            "file" | "files" => Some(Self::File),
            "prompt" | "prompts" => Some(Self::Prompt),
            "url" => Some(Self::Url),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tool => "tool",
            Self::File => "file",
            Self::Prompt => "prompt",
            Self::Url => "url",
        }
    }
}

/// A typed `@kind/target` reference found in message text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mention {
    pub kind: MentionKind,
    pub target: String,
    /// Byte range of the mention in the source text, punctuation excluded.
    pub start: usize,
    pub end: usize,
}

impl fmt::Display for Mention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}/{}", self.kind.as_str(), self.target)
    }
}

/// Find every mention in `text`, in order of appearance.
pub fn extract_mentions(text: &str) -> Vec<Mention> {
    MENTION_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let kind = MentionKind::from_prefix(caps.get(1)?.as_str())?;
            let raw_target = caps.get(2)?.as_str();
            let target = raw_target.trim_end_matches(TRAILING_PUNCTUATION);
            let trimmed = raw_target.len() - target.len();
            Some(Mention {
                kind,
                target: target.to_string(),
                start: whole.start(),
                end: whole.end() - trimmed,
            })
        })
        .collect()
}

#[derive(Clone, Debug)]
pub enum Resolution {
    Tool(ToolDefinition),
    Content { source: String, content: String },
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MentionError {
    #[error("not found")]
    NotFound,
    #[error("invalid reference: {0}")]
    Invalid(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("no provider for @{0}")]
    NoProvider(&'static str),
}

#[async_trait]
pub trait MentionProvider: Send + Sync {
    fn kind(&self) -> MentionKind;

    async fn resolve(&self, target: &str) -> Result<Resolution, MentionError>;
}

/// What mention resolution produced for one message.
#[derive(Clone, Debug, Default)]
pub struct MentionOutcome {
    /// Message text with unresolved mentions annotated in place.
    pub text: String,
    pub tools: Vec<ToolDefinition>,
    pub attachments: Vec<Attachment>,
    pub annotations: Vec<Annotation>,
}

/// Dispatches mentions to their providers.
#[derive(Default)]
pub struct MentionResolver {
    providers: HashMap<MentionKind, Arc<dyn MentionProvider>>,
}

impl MentionResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: Arc<dyn MentionProvider>) -> Self {
        self.providers.insert(provider.kind(), provider);
        self
    }

    async fn resolve_one(&self, mention: &Mention) -> Result<Resolution, MentionError> {
        let provider = self
            .providers
            .get(&mention.kind)
            .ok_or(MentionError::NoProvider(mention.kind.as_str()))?;
        if mention.target.is_empty() {
            return Err(MentionError::Invalid("empty target".into()));
        }
        provider.resolve(&mention.target).await
    }

    /// Resolve every mention in `text` concurrently. Failures never abort;
    /// each one is annotated inline right after the mention.
    pub async fn resolve(&self, text: &str) -> MentionOutcome {
        let mentions = extract_mentions(text);
        if mentions.is_empty() {
            return MentionOutcome {
                text: text.to_string(),
                ..Default::default()
            };
        }

        let results = futures::future::join_all(mentions.iter().map(|m| self.resolve_one(m))).await;

        let mut outcome = MentionOutcome::default();
        let mut annotated = String::with_capacity(text.len());
        let mut cursor = 0;
        for (mention, result) in mentions.iter().zip(results) {
            annotated.push_str(&text[cursor..mention.end]);
            cursor = mention.end;
            match result {
                Ok(Resolution::Tool(def)) => {
                    if !outcome.tools.iter().any(|t| t.name == def.name) {
                        outcome.tools.push(def);
                    }
                }
                Ok(Resolution::Content { source, content }) => {
                    if !outcome.attachments.iter().any(|a| a.source == source) {
                        outcome.attachments.push(Attachment {
                            source,
                            content,
                            truncated: false,
                        });
                    }
                }
                Err(e) => {
                    debug!(mention = %mention, error = %e, "mention unresolved");
                    annotated.push_str(&format!(" [unresolved: {e}]"));
                    outcome.annotations.push(Annotation::new(
                        AnnotationKind::UnresolvedMention,
                        format!("{mention}: {e}"),
                    ));
                }
            }
        }
        annotated.push_str(&text[cursor..]);
        outcome.text = annotated;
        outcome
    }
}

/// `@tools/<name>` against the tool catalog.
pub struct ToolMentionProvider {
    catalog: Arc<dyn ToolCatalog>,
}

impl ToolMentionProvider {
    pub fn new(catalog: Arc<dyn ToolCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl MentionProvider for ToolMentionProvider {
    fn kind(&self) -> MentionKind {
        MentionKind::Tool
    }

    async fn resolve(&self, target: &str) -> Result<Resolution, MentionError> {
        let def = self.catalog.get(target).ok_or(MentionError::NotFound)?;
        def.validate().map_err(|e| MentionError::Invalid(e.to_string()))?;
        Ok(Resolution::Tool(def))
    }
}

/// `@file/<relative path>` confined to a root directory.
pub struct FileMentionProvider {
    root: PathBuf,
}

impl FileMentionProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn sandboxed(&self, target: &str) -> Result<PathBuf, MentionError> {
        if Path::new(target).is_absolute() {
            return Err(MentionError::Invalid("absolute paths are not allowed".into()));
        }
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|e| MentionError::Fetch(format!("file root: {e}")))?;
        let path = match tokio::fs::canonicalize(root.join(target)).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(MentionError::NotFound),
            Err(e) => return Err(MentionError::Fetch(e.to_string())),
        };
        if !path.starts_with(&root) {
            return Err(MentionError::Invalid("path escapes the file root".into()));
        }
        Ok(path)
    }
}

#[async_trait]
impl MentionProvider for FileMentionProvider {
    fn kind(&self) -> MentionKind {
        MentionKind::File
    }

    async fn resolve(&self, target: &str) -> Result<Resolution, MentionError> {
        let path = self.sandboxed(target).await?;
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => MentionError::Invalid("not a text file".into()),
            _ => MentionError::Fetch(e.to_string()),
        })?;
        Ok(Resolution::Content {
            source: format!("file:{target}"),
            content,
        })
    }
}

/// `@prompt/<name>` from `<dir>/<name>.md` or `<dir>/<name>.txt`.
pub struct PromptMentionProvider {
    dir: PathBuf,
}

impl PromptMentionProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MentionProvider for PromptMentionProvider {
    fn kind(&self) -> MentionKind {
        MentionKind::Prompt
    }

    async fn resolve(&self, target: &str) -> Result<Resolution, MentionError> {
        validate_agent_id(target).map_err(|_| MentionError::Invalid("bad prompt name".into()))?;
        for ext in ["md", "txt"] {
            let path = self.dir.join(format!("{target}.{ext}"));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    return Ok(Resolution::Content {
                        source: format!("prompt:{target}"),
                        content,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MentionError::Fetch(e.to_string())),
            }
        }
        Err(MentionError::NotFound)
    }
}

/// Whether `ip` is routable on the public internet. Loopback, private,
/// link-local (cloud metadata included), shared, unspecified and multicast
/// ranges are not.
pub fn is_public_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_public_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_public_v4(v4);
            }
            let first = v6.segments()[0];
            !(v6.is_loopback()
                || v6.is_unspecified()
                || v6.is_multicast()
                || first & 0xfe00 == 0xfc00
                || first & 0xffc0 == 0xfe80)
        }
    }
}

fn is_public_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    !(ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        || a == 0
        || (a == 100 && (64..128).contains(&b)))
}

/// Resolves through the system resolver and keeps only public addresses, so
/// the address checked is the address connected to.
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(public_addrs(name.as_str().to_string()))
    }
}

async fn public_addrs(host: String) -> Result<Addrs, Box<dyn std::error::Error + Send + Sync>> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
        .await?
        .filter(|a| is_public_ip(a.ip()))
        .collect();
    if addrs.is_empty() {
        return Err(format!("{host} has no public address").into());
    }
    Ok(Box::new(addrs.into_iter()))
}

/// `@url/<http(s) url>` fetched with a bounded timeout. Only public hosts
/// are contacted, redirects are not followed and at most `max_bytes` of the
/// body is read.
pub struct UrlMentionProvider {
    client: reqwest::Client,
    max_bytes: usize,
    allow_private: bool,
}

impl UrlMentionProvider {
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        Self::build(timeout, max_bytes, false)
    }

    #[cfg(test)]
    fn allowing_private(timeout: Duration, max_bytes: usize) -> Result<Self, reqwest::Error> {
        Self::build(timeout, max_bytes, true)
    }

    fn build(timeout: Duration, max_bytes: usize, allow_private: bool) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy();
        if !allow_private {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }
        Ok(Self {
            client: builder.build()?,
            max_bytes,
            allow_private,
        })
    }

    async fn read_capped(&self, resp: reqwest::Response) -> Result<String, MentionError> {
        let mut stream = resp.bytes_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| MentionError::Fetch(e.to_string()))?;
            let room = self.max_bytes - body.len();
            if chunk.len() > room {
                body.extend_from_slice(&chunk[..room]);
                debug!(max_bytes = self.max_bytes, "url mention body capped");
                break;
            }
            body.extend_from_slice(&chunk);
        }
        Ok(decode_capped(body))
    }
}

/// Lossy UTF-8 decode that drops a code point split by the cap.
fn decode_capped(mut bytes: Vec<u8>) -> String {
    if let Err(e) = std::str::from_utf8(&bytes) {
        if e.error_len().is_none() {
            bytes.truncate(e.valid_up_to());
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[async_trait]
impl MentionProvider for UrlMentionProvider {
    fn kind(&self) -> MentionKind {
        MentionKind::Url
    }

    async fn resolve(&self, target: &str) -> Result<Resolution, MentionError> {
        let url = reqwest::Url::parse(target).map_err(|e| MentionError::Invalid(e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(MentionError::Invalid(format!("unsupported scheme {}", url.scheme())));
        }
        let host = url
            .host_str()
            .ok_or_else(|| MentionError::Invalid("missing host".into()))?;
        // Literal addresses never reach the resolver.
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            if !self.allow_private && !is_public_ip(ip) {
                return Err(MentionError::Invalid(format!("address {ip} is not public")));
            }
        }
        let resp = self.client.get(url).send().await.map_err(|e| {
            warn!(url = target, error = %e, "url mention fetch failed");
            MentionError::Fetch(e.to_string())
        })?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MentionError::NotFound);
        }
        if !status.is_success() {
            return Err(MentionError::Fetch(format!("status {}", status.as_u16())));
        }
        let body = self.read_capped(resp).await?;
        Ok(Resolution::Content {
            source: format!("url:{target}"),
            content: body,
        })
    }
}
