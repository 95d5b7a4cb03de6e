//! Request and response models for the Yeti v2 API

use crate::error::{YetiError, YetiResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Any object returned by Yeti. The server owns the schema.
pub type YetiObject = Map<String, Value>;

/// A graph link returned by `/graph/add`
pub type YetiLinkObject = Map<String, Value>;

/// Top-level object families and their collection endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootType {
    Indicator,
    Entity,
    Observable,
    Dfiq,
}

impl RootType {
    pub fn endpoint(&self) -> &'static str {
        match self {
            RootType::Indicator => "/api/v2/indicators",
            RootType::Entity => "/api/v2/entities",
            RootType::Observable => "/api/v2/observables",
            RootType::Dfiq => "/api/v2/dfiq",
        }
    }
}

impl fmt::Display for RootType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootType::Indicator => write!(f, "indicator"),
            RootType::Entity => write!(f, "entity"),
            RootType::Observable => write!(f, "observable"),
            RootType::Dfiq => write!(f, "dfiq"),
        }
    }
}

impl FromStr for RootType {
    type Err = YetiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "indicator" => Ok(RootType::Indicator),
            "entity" => Ok(RootType::Entity),
            "observable" => Ok(RootType::Observable),
            "dfiq" => Ok(RootType::Dfiq),
            other => Err(YetiError::invalid_argument(format!(
                "Unknown root type: {}",
                other
            ))),
        }
    }
}

/// Render a JSON scalar id the way Yeti prints it in paths ("123", not "\"123\"")
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the `id` field of an object
pub fn object_id(object: &YetiObject) -> YetiResult<String> {
    object
        .get("id")
        .and_then(id_string)
        .ok_or_else(|| YetiError::invalid_argument("Object has no usable 'id' field"))
}

/// Extract the `root_type` field of an object
pub fn object_root_type(object: &YetiObject) -> YetiResult<RootType> {
    object
        .get("root_type")
        .and_then(Value::as_str)
        .ok_or_else(|| YetiError::invalid_argument("Object has no 'root_type' field"))?
        .parse()
}

/// `"<root_type>/<id>"` reference used by the graph endpoints
pub fn object_ref(object: &YetiObject) -> YetiResult<String> {
    let root_type = object
        .get("root_type")
        .and_then(Value::as_str)
        .ok_or_else(|| YetiError::invalid_argument("Object has no 'root_type' field"))?;
    Ok(format!("{}/{}", root_type, object_id(object)?))
}

/// Filters for indicator search. At least one must be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndicatorQuery {
    pub name: Option<String>,
    pub indicator_type: Option<String>,
    pub pattern: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl IndicatorQuery {
    pub fn by_name<S: Into<String>>(name: S) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_type<S: Into<String>>(mut self, indicator_type: S) -> Self {
        self.indicator_type = Some(indicator_type.into());
        self
    }

    pub fn with_pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_description<S: Into<String>>(mut self, description: S) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.name.as_deref().map_or(true, str::is_empty)
            && self.indicator_type.as_deref().map_or(true, str::is_empty)
            && self.pattern.as_deref().map_or(true, str::is_empty)
            && self.description.as_deref().map_or(true, str::is_empty)
            && self.tags.is_empty()
    }

    /// The `query` object sent to `/indicators/search`
    pub fn to_query(&self) -> Value {
        let mut query = Map::new();
        let fields = [
            ("name", &self.name),
            ("pattern", &self.pattern),
            ("type", &self.indicator_type),
            ("description", &self.description),
        ];
        for (key, value) in fields {
            if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
                query.insert(key.to_string(), Value::String(v.to_string()));
            }
        }
        if !self.tags.is_empty() {
            query.insert("tags".to_string(), Value::from(self.tags.clone()));
        }
        Value::Object(query)
    }
}

/// Traversal direction for graph searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphDirection {
    #[default]
    Outbound,
    Inbound,
    Any,
}

/// Body of `/graph/search`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphSearch {
    pub count: u32,
    /// `"<root_type>/<id>"`, e.g. `indicator/1234`
    pub source: String,
    pub graph: String,
    pub min_hops: u32,
    pub max_hops: u32,
    pub direction: GraphDirection,
    pub include_original: bool,
    pub target_types: Vec<String>,
}

impl GraphSearch {
    pub fn new<S: Into<String>>(source: S) -> Self {
        Self {
            count: 0,
            source: source.into(),
            graph: "links".to_string(),
            min_hops: 1,
            max_hops: 1,
            direction: GraphDirection::Outbound,
            include_original: true,
            target_types: Vec::new(),
        }
    }

    pub fn graph<S: Into<String>>(mut self, graph: S) -> Self {
        self.graph = graph.into();
        self
    }

    pub fn target_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn hops(mut self, min_hops: u32, max_hops: u32) -> Self {
        self.min_hops = min_hops;
        self.max_hops = max_hops;
        self
    }

    pub fn direction(mut self, direction: GraphDirection) -> Self {
        self.direction = direction;
        self
    }

    pub fn include_original(mut self, include: bool) -> Self {
        self.include_original = include;
        self
    }
}

/// One entry of a bloom filter search response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloomHit {
    pub value: String,
    #[serde(default)]
    pub hits: Vec<String>,
}

/// Response of `/observables/bulk`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkAddResult {
    #[serde(default)]
    pub added: Vec<YetiObject>,
    #[serde(default)]
    pub failed: Vec<String>,
}

/// A single observable to bulk-add
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewObservable {
    pub value: String,
    #[serde(rename = "type")]
    pub observable_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl NewObservable {
    pub fn new<V: Into<String>, T: Into<String>>(value: V, observable_type: T) -> Self {
        Self {
            value: value.into(),
            observable_type: observable_type.into(),
            tags: Vec::new(),
        }
    }
}

/// Body of `/indicators/yara/bundle`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct YaraBundleRequest {
    pub ids: Vec<String>,
    pub tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub overlays: Vec<String>,
}

/// Body of `/dfiq/from_yaml` and the YAML variant of `PATCH /dfiq/{id}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub(crate) struct DfiqYamlRequest<'a> {
    pub dfiq_type: &'a str,
    pub dfiq_yaml: &'a str,
    pub update_indicators: bool,
}

/// Response of `/auth/api-token`
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AccessTokenResponse {
    pub access_token: Option<String>,
}
