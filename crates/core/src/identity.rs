//! Opaque, reversible identity token for applied objects.
//!
//! A token is built once, on the first CREATE step, from the client request token, the
//! cluster name, the namespace and the kubectl resource type. It is never re-derived from
//! mutable object fields: on retries the token is used to re-discover the object by its
//! idempotency annotation.
//!
//! Format `v1.<base64url(len:field len:field len:field len:field)>`. Fields are length
//! prefixed, so they may contain any character. Tokens of the earlier format
//! (`base64url("token|cluster|namespace|kind")`, no version tag) still decode, but that
//! format cannot represent fields containing `|`.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

const V1_PREFIX: &str = "v1.";
const LEGACY_SEPARATOR: char = '|';

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub client_token: String,
    pub cluster_name: String,
    pub namespace: String,
    /// kubectl resource type, e.g. `job.v1.batch`.
    pub kind: String,
}

impl ResourceIdentity {
    pub fn new(
        client_token: impl Into<String>,
        cluster_name: impl Into<String>,
        namespace: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            client_token: client_token.into(),
            cluster_name: cluster_name.into(),
            namespace: namespace.into(),
            kind: kind.into(),
        }
    }

    pub fn encode(&self) -> String {
        let mut raw = String::new();
        for field in self.fields() {
            raw.push_str(&field.len().to_string());
            raw.push(':');
            raw.push_str(field);
        }
        format!("{}{}", V1_PREFIX, URL_SAFE_NO_PAD.encode(raw.as_bytes()))
    }

    pub fn decode(token: &str) -> Result<Self, IdentityError> {
        let token = token.trim();
        if let Some(body) = token.strip_prefix(V1_PREFIX) {
            let raw = decode_b64(body)?;
            return Self::from_fields(parse_length_prefixed(&raw)?);
        }
        if let Some((version, _)) = token.split_once('.') {
            return Err(IdentityError::Version(version.to_string()));
        }
        let raw = decode_b64(token)?;
        let text = String::from_utf8(raw).map_err(|_| IdentityError::Utf8)?;
        Self::from_fields(text.split(LEGACY_SEPARATOR).map(str::to_string).collect())
    }

    /// Cluster name, `None` when the object lives in the ambient kubeconfig context.
    pub fn cluster(&self) -> Option<&str> {
        Some(self.cluster_name.as_str()).filter(|c| !c.is_empty())
    }

    fn fields(&self) -> [&str; 4] {
        [&self.client_token, &self.cluster_name, &self.namespace, &self.kind]
    }

    fn from_fields(fields: Vec<String>) -> Result<Self, IdentityError> {
        let n = fields.len();
        let [client_token, cluster_name, namespace, kind]: [String; 4] =
            fields.try_into().map_err(|_| IdentityError::FieldCount(n))?;
        Ok(Self { client_token, cluster_name, namespace, kind })
    }
}

fn decode_b64(s: &str) -> Result<Vec<u8>, IdentityError> {
    URL_SAFE_NO_PAD
        .decode(s)
        .or_else(|_| STANDARD.decode(s))
        .map_err(|e| IdentityError::Encoding(e.to_string()))
}

fn parse_length_prefixed(raw: &[u8]) -> Result<Vec<String>, IdentityError> {
    let mut fields = Vec::with_capacity(4);
    let mut rest = raw;
    while !rest.is_empty() {
        let idx = fields.len();
        let colon = rest.iter().position(|b| *b == b':').ok_or(IdentityError::Malformed(idx))?;
        let len: usize = std::str::from_utf8(&rest[..colon])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(IdentityError::Malformed(idx))?;
        let start = colon + 1;
        let end = start.checked_add(len).filter(|e| *e <= rest.len()).ok_or(IdentityError::Malformed(idx))?;
        let field = String::from_utf8(rest[start..end].to_vec()).map_err(|_| IdentityError::Utf8)?;
        fields.push(field);
        rest = &rest[end..];
    }
    Ok(fields)
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for ResourceIdentity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}
