//! Schema representation types.
//!
//! These types describe collections the way the catalog stores them: a
//! stable id, a human name, an ordered list of typed fields, access rules,
//! indexes and kind-specific options. The serialized form is the familiar
//! collection JSON (`type`, `schema`, `options`, camelCase keys), so exported
//! snapshots can be read back without a translation layer.

use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::ValidationError;

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

static COLLECTION_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,100}$").expect("collection reference regex"));

static MIME_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[\w.+-]+/[\w.+-]+$").expect("mime type regex"));

/// Columns every collection carries implicitly.
pub const BASE_SYSTEM_FIELDS: &[&str] = &[
    "id",
    "created",
    "updated",
    "collectionId",
    "collectionName",
    "expand",
];

/// Additional columns carried by auth collections.
pub const AUTH_SYSTEM_FIELDS: &[&str] = &[
    "username",
    "email",
    "emailVisibility",
    "verified",
    "tokenKey",
    "passwordHash",
    "lastResetSentAt",
    "lastVerificationSentAt",
    "password",
    "passwordConfirm",
    "oldPassword",
];

/// Maximum length of a collection name.
const MAX_NAME_LENGTH: usize = 255;

/// The kind of collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    /// Regular record collection.
    #[default]
    Base,
    /// Collection whose records can authenticate.
    Auth,
    /// Read-only collection backed by a query.
    View,
}

impl CollectionKind {
    /// Returns the serialized name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Auth => "auth",
            Self::View => "view",
        }
    }
}

impl fmt::Display for CollectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for `text` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TextOptions {
    /// Minimum length.
    pub min: Option<u64>,
    /// Maximum length.
    pub max: Option<u64>,
    /// Regex the value must match (empty for none).
    pub pattern: String,
}

/// Options for `number` fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NumberOptions {
    /// Minimum value.
    pub min: Option<f64>,
    /// Maximum value.
    pub max: Option<f64>,
    /// Whether decimals are rejected.
    pub no_decimal: bool,
}

/// `bool` fields take no options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoolOptions {}

/// Options for `email` and `url` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainOptions {
    /// Domains that are rejected.
    pub except_domains: Option<Vec<String>>,
    /// Domains that are the only ones accepted.
    pub only_domains: Option<Vec<String>>,
}

/// Options for `editor` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EditorOptions {
    /// Whether URLs are rewritten to relative form.
    pub convert_urls: bool,
}

/// Options for `date` fields. Bounds are empty or a timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DateOptions {
    /// Earliest accepted date.
    pub min: String,
    /// Latest accepted date.
    pub max: String,
}

/// Options for `select` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SelectOptions {
    /// How many values a record may pick.
    pub max_select: u32,
    /// The enumerated values.
    pub values: Vec<String>,
}

impl Default for SelectOptions {
    fn default() -> Self {
        Self {
            max_select: 1,
            values: Vec::new(),
        }
    }
}

/// Options for `json` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JsonOptions {
    /// Maximum encoded size in bytes.
    pub max_size: u64,
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self {
            max_size: 2_000_000,
        }
    }
}

/// Options for `file` fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileOptions {
    /// Accepted MIME types (empty accepts all).
    pub mime_types: Vec<String>,
    /// Thumbnail sizes.
    pub thumbs: Option<Vec<String>>,
    /// Maximum number of files.
    pub max_select: u32,
    /// Maximum size per file in bytes.
    pub max_size: u64,
    /// Whether files need a token to be served.
    pub protected: bool,
}

impl Default for FileOptions {
    fn default() -> Self {
        Self {
            mime_types: Vec::new(),
            thumbs: None,
            max_select: 1,
            max_size: 5_242_880,
            protected: false,
        }
    }
}

/// Options for `relation` fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationOptions {
    /// Target collection, by id or name. The importer rewrites it to the id.
    pub collection_id: String,
    /// Whether deleting the target deletes the referencing record.
    pub cascade_delete: bool,
    /// Minimum number of related records.
    pub min_select: Option<u32>,
    /// Maximum number of related records.
    pub max_select: Option<u32>,
    /// Target fields shown when presenting the relation.
    pub display_fields: Option<Vec<String>>,
}

/// The declared type of a field, with its type-specific options.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Plain text.
    Text(TextOptions),
    /// Number.
    Number(NumberOptions),
    /// Boolean.
    Bool(BoolOptions),
    /// Email address.
    Email(DomainOptions),
    /// URL.
    Url(DomainOptions),
    /// Rich text.
    Editor(EditorOptions),
    /// Date and time.
    Date(DateOptions),
    /// One or more values from a fixed list.
    Select(SelectOptions),
    /// Arbitrary JSON.
    Json(JsonOptions),
    /// Uploaded files.
    File(FileOptions),
    /// Reference to records of another collection.
    Relation(RelationOptions),
}

impl FieldKind {
    /// Text field with default options.
    #[must_use]
    pub fn text() -> Self {
        Self::Text(TextOptions::default())
    }

    /// Number field with default options.
    #[must_use]
    pub fn number() -> Self {
        Self::Number(NumberOptions::default())
    }

    /// Boolean field.
    #[must_use]
    pub fn boolean() -> Self {
        Self::Bool(BoolOptions::default())
    }

    /// Email field with default options.
    #[must_use]
    pub fn email() -> Self {
        Self::Email(DomainOptions::default())
    }

    /// URL field with default options.
    #[must_use]
    pub fn url() -> Self {
        Self::Url(DomainOptions::default())
    }

    /// Editor field with default options.
    #[must_use]
    pub fn editor() -> Self {
        Self::Editor(EditorOptions::default())
    }

    /// Date field without bounds.
    #[must_use]
    pub fn date() -> Self {
        Self::Date(DateOptions::default())
    }

    /// Single-choice select over `values`.
    #[must_use]
    pub fn select<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Select(SelectOptions {
            max_select: 1,
            values: values.into_iter().map(Into::into).collect(),
        })
    }

    /// JSON field with the default size limit.
    #[must_use]
    pub fn json() -> Self {
        Self::Json(JsonOptions::default())
    }

    /// Single-file field accepting `mime_types`.
    #[must_use]
    pub fn file<I, S>(mime_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::File(FileOptions {
            mime_types: mime_types.into_iter().map(Into::into).collect(),
            ..FileOptions::default()
        })
    }

    /// Single relation to `target` (collection id or name).
    #[must_use]
    pub fn relation(target: impl Into<String>) -> Self {
        Self::Relation(RelationOptions {
            collection_id: target.into(),
            max_select: Some(1),
            ..RelationOptions::default()
        })
    }

    /// Returns the serialized type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Email(_) => "email",
            Self::Url(_) => "url",
            Self::Editor(_) => "editor",
            Self::Date(_) => "date",
            Self::Select(_) => "select",
            Self::Json(_) => "json",
            Self::File(_) => "file",
            Self::Relation(_) => "relation",
        }
    }

    /// Returns the relation target if this is a relation field.
    #[must_use]
    pub fn relation_target(&self) -> Option<&str> {
        match self {
            Self::Relation(options) => Some(options.collection_id.as_str()),
            _ => None,
        }
    }

    fn from_parts(name: &str, type_name: &str, options: serde_json::Value) -> Result<Self, ValidationError> {
        let options = match options {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };
        Ok(match type_name {
            "text" => Self::Text(decode_options(name, options)?),
            "number" => Self::Number(decode_options(name, options)?),
            "bool" => Self::Bool(decode_options(name, options)?),
            "email" => Self::Email(decode_options(name, options)?),
            "url" => Self::Url(decode_options(name, options)?),
            "editor" => Self::Editor(decode_options(name, options)?),
            "date" => Self::Date(decode_options(name, options)?),
            "select" => Self::Select(decode_options(name, options)?),
            "json" => Self::Json(decode_options(name, options)?),
            "file" => Self::File(decode_options(name, options)?),
            "relation" => Self::Relation(decode_options(name, options)?),
            other => return Err(ValidationError::UnknownFieldType(other.to_string())),
        })
    }
}

fn decode_options<T: DeserializeOwned>(name: &str, options: serde_json::Value) -> Result<T, ValidationError> {
    serde_json::from_value(options).map_err(|e| ValidationError::MalformedOptions {
        name: name.to_string(),
        message: e.to_string(),
    })
}

/// Schema definition for a field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawField")]
pub struct FieldDefinition {
    /// Stable field id, if one was assigned.
    pub id: Option<String>,
    /// Field name.
    pub name: String,
    /// Declared type and options.
    pub kind: FieldKind,
    /// Whether a value is required.
    pub required: bool,
    /// Whether values must be unique.
    pub unique: bool,
    /// Whether the field is used when presenting a record.
    pub presentable: bool,
    /// Whether the field is managed by the platform.
    pub system: bool,
}

impl FieldDefinition {
    /// Creates a new optional, non-unique field.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: None,
            name: name.into(),
            kind,
            required: false,
            unique: false,
            presentable: false,
            system: false,
        }
    }

    /// Assigns a stable field id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Marks the field as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Marks the field as unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Marks the field as presentable.
    #[must_use]
    pub fn presentable(mut self) -> Self {
        self.presentable = true;
        self
    }

    /// Compares everything except the stable id.
    #[must_use]
    pub fn same_definition(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.required == other.required
            && self.unique == other.unique
            && self.presentable == other.presentable
            && self.system == other.system
    }
}

#[derive(Deserialize)]
struct RawField {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    presentable: bool,
    #[serde(default)]
    system: bool,
    #[serde(default)]
    options: serde_json::Value,
}

impl TryFrom<RawField> for FieldDefinition {
    type Error = ValidationError;

    fn try_from(raw: RawField) -> Result<Self, Self::Error> {
        let kind = FieldKind::from_parts(&raw.name, &raw.kind, raw.options)?;
        Ok(Self {
            id: raw.id.filter(|id| !id.is_empty()),
            name: raw.name,
            kind,
            required: raw.required,
            unique: raw.unique,
            presentable: raw.presentable,
            system: raw.system,
        })
    }
}

impl Serialize for FieldDefinition {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("FieldDefinition", 8)?;
        match &self.id {
            Some(id) => state.serialize_field("id", id)?,
            None => state.skip_field("id")?,
        }
        state.serialize_field("system", &self.system)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", self.kind.type_name())?;
        state.serialize_field("required", &self.required)?;
        state.serialize_field("presentable", &self.presentable)?;
        state.serialize_field("unique", &self.unique)?;
        match &self.kind {
            FieldKind::Text(o) => state.serialize_field("options", o)?,
            FieldKind::Number(o) => state.serialize_field("options", o)?,
            FieldKind::Bool(o) => state.serialize_field("options", o)?,
            FieldKind::Email(o) | FieldKind::Url(o) => state.serialize_field("options", o)?,
            FieldKind::Editor(o) => state.serialize_field("options", o)?,
            FieldKind::Date(o) => state.serialize_field("options", o)?,
            FieldKind::Select(o) => state.serialize_field("options", o)?,
            FieldKind::Json(o) => state.serialize_field("options", o)?,
            FieldKind::File(o) => state.serialize_field("options", o)?,
            FieldKind::Relation(o) => state.serialize_field("options", o)?,
        }
        state.end()
    }
}

/// Access rules. `None` restricts the action to superusers, `Some("")`
/// makes it public, anything else is a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRules {
    /// Rule for listing records.
    pub list_rule: Option<String>,
    /// Rule for viewing a record.
    pub view_rule: Option<String>,
    /// Rule for creating records.
    pub create_rule: Option<String>,
    /// Rule for updating records.
    pub update_rule: Option<String>,
    /// Rule for deleting records.
    pub delete_rule: Option<String>,
}

impl AccessRules {
    /// Every action open to everyone.
    #[must_use]
    pub fn public() -> Self {
        let open = Some(String::new());
        Self {
            list_rule: open.clone(),
            view_rule: open.clone(),
            create_rule: open.clone(),
            update_rule: open.clone(),
            delete_rule: open,
        }
    }
}

/// Schema definition for an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSchema {
    /// Index name.
    pub name: String,
    /// Columns included in the index.
    pub columns: Vec<String>,
    /// Whether this is a unique index.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSchema {
    /// Creates a non-unique index.
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    /// Makes the index unique.
    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Base collections carry no options.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BaseOptions {}

/// Options of auth collections.
///
/// Every key is optional so a partial definition can be merged over the
/// stored one without dropping password policy settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthOptions {
    /// Whether users may sign in with email and password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_email_auth: Option<bool>,
    /// Whether users may sign in through OAuth2 providers.
    #[serde(rename = "allowOAuth2Auth", skip_serializing_if = "Option::is_none")]
    pub allow_oauth2_auth: Option<bool>,
    /// Whether users may sign in with username and password.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_username_auth: Option<bool>,
    /// Email domains that may not register.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub except_email_domains: Option<Vec<String>>,
    /// If set, the only email domains that may register.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_email_domains: Option<Vec<String>>,
    /// Rule granting management of other users' auth fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manage_rule: Option<String>,
    /// Minimum password length.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_password_length: Option<u32>,
    /// Whether only verified users may authenticate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_verified: Option<bool>,
    /// Whether an email address is required.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub require_email: Option<bool>,
}

impl AuthOptions {
    /// Overlays the keys set in `self` on top of `existing`.
    #[must_use]
    pub fn merged_over(&self, existing: &Self) -> Self {
        Self {
            allow_email_auth: self.allow_email_auth.or(existing.allow_email_auth),
            allow_oauth2_auth: self.allow_oauth2_auth.or(existing.allow_oauth2_auth),
            allow_username_auth: self.allow_username_auth.or(existing.allow_username_auth),
            except_email_domains: self
                .except_email_domains
                .clone()
                .or_else(|| existing.except_email_domains.clone()),
            only_email_domains: self
                .only_email_domains
                .clone()
                .or_else(|| existing.only_email_domains.clone()),
            manage_rule: self.manage_rule.clone().or_else(|| existing.manage_rule.clone()),
            min_password_length: self.min_password_length.or(existing.min_password_length),
            only_verified: self.only_verified.or(existing.only_verified),
            require_email: self.require_email.or(existing.require_email),
        }
    }
}

/// Options of view collections.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ViewOptions {
    /// The query backing the view.
    pub query: String,
}

/// Kind-specific collection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum CollectionOptions {
    /// Options of a base collection.
    Base(BaseOptions),
    /// Options of an auth collection.
    Auth(AuthOptions),
    /// Options of a view collection.
    View(ViewOptions),
}

impl CollectionOptions {
    /// Default options for `kind`.
    #[must_use]
    pub fn for_kind(kind: CollectionKind) -> Self {
        match kind {
            CollectionKind::Base => Self::Base(BaseOptions::default()),
            CollectionKind::Auth => Self::Auth(AuthOptions::default()),
            CollectionKind::View => Self::View(ViewOptions::default()),
        }
    }

    /// Returns the collection kind these options belong to.
    #[must_use]
    pub fn kind(&self) -> CollectionKind {
        match self {
            Self::Base(_) => CollectionKind::Base,
            Self::Auth(_) => CollectionKind::Auth,
            Self::View(_) => CollectionKind::View,
        }
    }

    fn decode(name: &str, kind: CollectionKind, raw: serde_json::Value) -> Result<Self, ValidationError> {
        let raw = match raw {
            serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
            other => other,
        };
        match kind {
            CollectionKind::Base => match &raw {
                serde_json::Value::Object(map) if map.is_empty() => Ok(Self::Base(BaseOptions {})),
                _ => Err(ValidationError::MalformedOptions {
                    name: name.to_string(),
                    message: "base collections take no options".to_string(),
                }),
            },
            CollectionKind::Auth => Ok(Self::Auth(decode_options(name, raw)?)),
            CollectionKind::View => Ok(Self::View(decode_options(name, raw)?)),
        }
    }
}

/// Complete schema definition for a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCollection")]
pub struct CollectionSchema {
    /// Stable id. Never changes once assigned.
    pub id: String,
    /// Human-readable, unique name.
    pub name: String,
    /// Collection kind.
    #[serde(rename = "type")]
    pub kind: CollectionKind,
    /// Whether the collection is managed by the platform.
    pub system: bool,
    /// Field definitions, in display order.
    #[serde(rename = "schema")]
    pub fields: Vec<FieldDefinition>,
    /// Index definitions.
    pub indexes: Vec<IndexSchema>,
    /// Access rules.
    #[serde(flatten)]
    pub rules: AccessRules,
    /// Kind-specific options.
    pub options: CollectionOptions,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCollection {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(rename = "type", default)]
    kind: CollectionKind,
    #[serde(default)]
    system: bool,
    #[serde(default, alias = "fields")]
    schema: Vec<FieldDefinition>,
    #[serde(default)]
    indexes: Vec<IndexSchema>,
    #[serde(default)]
    list_rule: Option<String>,
    #[serde(default)]
    view_rule: Option<String>,
    #[serde(default)]
    create_rule: Option<String>,
    #[serde(default)]
    update_rule: Option<String>,
    #[serde(default)]
    delete_rule: Option<String>,
    #[serde(default)]
    options: serde_json::Value,
}

impl TryFrom<RawCollection> for CollectionSchema {
    type Error = ValidationError;

    fn try_from(raw: RawCollection) -> Result<Self, Self::Error> {
        let options = CollectionOptions::decode(&raw.name, raw.kind, raw.options)?;
        Ok(Self {
            id: raw.id,
            name: raw.name,
            kind: raw.kind,
            system: raw.system,
            fields: raw.schema,
            indexes: raw.indexes,
            rules: AccessRules {
                list_rule: raw.list_rule,
                view_rule: raw.view_rule,
                create_rule: raw.create_rule,
                update_rule: raw.update_rule,
                delete_rule: raw.delete_rule,
            },
            options,
        })
    }
}

impl CollectionSchema {
    /// Creates a new base collection without fields.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: CollectionKind::Base,
            system: false,
            fields: Vec::new(),
            indexes: Vec::new(),
            rules: AccessRules::default(),
            options: CollectionOptions::Base(BaseOptions::default()),
        }
    }

    /// Turns this into an auth collection with default options.
    #[must_use]
    pub fn auth(self) -> Self {
        self.auth_options(AuthOptions::default())
    }

    /// Turns this into an auth collection with the given options.
    #[must_use]
    pub fn auth_options(mut self, options: AuthOptions) -> Self {
        self.kind = CollectionKind::Auth;
        self.options = CollectionOptions::Auth(options);
        self
    }

    /// Turns this into a view collection backed by `query`.
    #[must_use]
    pub fn view(mut self, query: impl Into<String>) -> Self {
        self.kind = CollectionKind::View;
        self.options = CollectionOptions::View(ViewOptions { query: query.into() });
        self
    }

    /// Marks the collection as a system collection.
    #[must_use]
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDefinition) -> Self {
        self.fields.push(field);
        self
    }

    /// Adds an index.
    #[must_use]
    pub fn index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Replaces the access rules.
    #[must_use]
    pub fn rules(mut self, rules: AccessRules) -> Self {
        self.rules = rules;
        self
    }

    /// Gets a field by name (case-insensitive).
    #[must_use]
    pub fn get_field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Returns the field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Returns `(field, target)` for every relation field.
    pub fn relations(&self) -> impl Iterator<Item = (&FieldDefinition, &str)> {
        self.fields
            .iter()
            .filter_map(|f| f.kind.relation_target().map(|target| (f, target)))
    }

    /// Returns the auth options if this is an auth collection.
    #[must_use]
    pub fn auth_settings(&self) -> Option<&AuthOptions> {
        match &self.options {
            CollectionOptions::Auth(options) => Some(options),
            _ => None,
        }
    }

    /// Validates this schema.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate(self)
    }
}

/// Returns the names reserved for system columns in a collection of `kind`.
fn reserved_names(kind: CollectionKind) -> impl Iterator<Item = &'static str> {
    let auth: &'static [&'static str] = if kind == CollectionKind::Auth {
        AUTH_SYSTEM_FIELDS
    } else {
        &[]
    };
    BASE_SYSTEM_FIELDS.iter().chain(auth).copied()
}

/// Checks a collection definition without touching any store.
///
/// Relation targets are only checked for syntax: the target may be created
/// later in the same import.
pub fn validate(schema: &CollectionSchema) -> Result<(), ValidationError> {
    let mut errors = Vec::new();

    if !COLLECTION_REF.is_match(&schema.id) {
        errors.push(ValidationError::InvalidCollectionId(schema.id.clone()));
    }
    if schema.name.len() > MAX_NAME_LENGTH || !IDENTIFIER.is_match(&schema.name) {
        errors.push(ValidationError::InvalidCollectionName(schema.name.clone()));
    }

    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for field in &schema.fields {
        if !IDENTIFIER.is_match(&field.name) {
            errors.push(ValidationError::InvalidFieldName {
                collection: schema.name.clone(),
                field: field.name.clone(),
            });
        } else if reserved_names(schema.kind).any(|r| r.eq_ignore_ascii_case(&field.name)) {
            errors.push(ValidationError::ReservedFieldName {
                collection: schema.name.clone(),
                field: field.name.clone(),
            });
        }

        if !names.insert(field.name.to_ascii_lowercase()) {
            errors.push(ValidationError::DuplicateField {
                collection: schema.name.clone(),
                field: field.name.clone(),
            });
        }

        if let Some(id) = &field.id {
            if !ids.insert(id.as_str()) {
                errors.push(ValidationError::DuplicateFieldId {
                    collection: schema.name.clone(),
                    id: id.clone(),
                });
            }
        }

        validate_field(schema, field, &mut errors);
    }

    validate_indexes(schema, &mut errors);
    validate_options(schema, &mut errors);

    ValidationError::from_list(errors)
}

fn validate_field(schema: &CollectionSchema, field: &FieldDefinition, errors: &mut Vec<ValidationError>) {
    let invalid = |message: &str| ValidationError::InvalidOptions {
        collection: schema.name.clone(),
        field: field.name.clone(),
        kind: field.kind.type_name(),
        message: message.to_string(),
    };

    match &field.kind {
        FieldKind::Text(o) => {
            if matches!((o.min, o.max), (Some(min), Some(max)) if min > max) {
                errors.push(invalid("min must not exceed max"));
            }
            if !o.pattern.is_empty() {
                if let Err(e) = Regex::new(&o.pattern) {
                    errors.push(invalid(&format!("pattern does not compile: {}", e)));
                }
            }
        }
        FieldKind::Number(o) => {
            if o.min.is_some_and(|v| !v.is_finite()) || o.max.is_some_and(|v| !v.is_finite()) {
                errors.push(invalid("bounds must be finite"));
            } else if matches!((o.min, o.max), (Some(min), Some(max)) if min > max) {
                errors.push(invalid("min must not exceed max"));
            }
        }
        FieldKind::Email(o) | FieldKind::Url(o) => {
            if non_empty(&o.except_domains) && non_empty(&o.only_domains) {
                errors.push(invalid("exceptDomains and onlyDomains are mutually exclusive"));
            }
        }
        FieldKind::Date(o) => {
            let min = parse_bound(&o.min);
            let max = parse_bound(&o.max);
            match (min, max) {
                (Err(()), _) => errors.push(invalid(&format!("min '{}' is not a timestamp", o.min))),
                (_, Err(())) => errors.push(invalid(&format!("max '{}' is not a timestamp", o.max))),
                (Ok(Some(min)), Ok(Some(max))) if min > max => {
                    errors.push(invalid("min must not be after max"));
                }
                _ => {}
            }
        }
        FieldKind::Select(o) => {
            if o.values.is_empty() {
                errors.push(invalid("at least one value is required"));
            }
            let mut seen = HashSet::new();
            if let Some(dup) = o.values.iter().find(|v| !seen.insert(v.as_str())) {
                errors.push(invalid(&format!("value '{}' is listed twice", dup)));
            }
            if o.max_select == 0 || o.max_select as usize > o.values.len().max(1) {
                errors.push(invalid("maxSelect must be between 1 and the number of values"));
            }
        }
        FieldKind::Json(o) => {
            if o.max_size == 0 {
                errors.push(invalid("maxSize must be positive"));
            }
        }
        FieldKind::File(o) => {
            if o.max_select == 0 {
                errors.push(invalid("maxSelect must be at least 1"));
            }
            if o.max_size == 0 {
                errors.push(invalid("maxSize must be positive"));
            }
            for mime in &o.mime_types {
                if !MIME_TYPE.is_match(mime) {
                    errors.push(invalid(&format!("'{}' is not a MIME type", mime)));
                }
            }
        }
        FieldKind::Relation(o) => {
            if !COLLECTION_REF.is_match(&o.collection_id) {
                errors.push(ValidationError::MalformedRelationTarget {
                    collection: schema.name.clone(),
                    field: field.name.clone(),
                    target: o.collection_id.clone(),
                });
            }
            if o.max_select == Some(0) {
                errors.push(invalid("maxSelect must be at least 1"));
            }
            if matches!((o.min_select, o.max_select), (Some(min), Some(max)) if min > max) {
                errors.push(invalid("minSelect must not exceed maxSelect"));
            }
        }
        FieldKind::Bool(_) | FieldKind::Editor(_) => {}
    }
}

fn validate_indexes(schema: &CollectionSchema, errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();
    for index in &schema.indexes {
        let invalid = |message: String| ValidationError::InvalidIndex {
            collection: schema.name.clone(),
            index: index.name.clone(),
            message,
        };

        if !IDENTIFIER.is_match(&index.name) {
            errors.push(invalid("name is not a valid identifier".to_string()));
        }
        if !names.insert(index.name.to_ascii_lowercase()) {
            errors.push(invalid("name is used twice".to_string()));
        }
        if index.columns.is_empty() {
            errors.push(invalid("at least one column is required".to_string()));
        }
        for column in &index.columns {
            let known = schema.get_field(column).is_some()
                || reserved_names(schema.kind).any(|r| r.eq_ignore_ascii_case(column));
            if !known {
                errors.push(invalid(format!("unknown column '{}'", column)));
            }
        }
    }
}

fn validate_options(schema: &CollectionSchema, errors: &mut Vec<ValidationError>) {
    let invalid = |message: &str| ValidationError::InvalidCollectionOptions {
        collection: schema.name.clone(),
        message: message.to_string(),
    };

    if schema.options.kind() != schema.kind {
        errors.push(invalid("options do not match the collection type"));
        return;
    }

    match &schema.options {
        CollectionOptions::Auth(o) => {
            if o.min_password_length.is_some_and(|len| !(5..=72).contains(&len)) {
                errors.push(invalid("minPasswordLength must be between 5 and 72"));
            }
            if non_empty(&o.except_email_domains) && non_empty(&o.only_email_domains) {
                errors.push(invalid("exceptEmailDomains and onlyEmailDomains are mutually exclusive"));
            }
        }
        CollectionOptions::View(o) => {
            if o.query.trim().is_empty() {
                errors.push(invalid("view collections need a query"));
            }
        }
        CollectionOptions::Base(_) => {}
    }
}

fn non_empty(list: &Option<Vec<String>>) -> bool {
    list.as_ref().is_some_and(|l| !l.is_empty())
}

/// Parses an optional timestamp bound; `Err` means the text is not a date.
fn parse_bound(value: &str) -> Result<Option<NaiveDateTime>, ()> {
    if value.is_empty() {
        return Ok(None);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(Some(dt.naive_utc()));
    }
    NaiveDateTime::parse_from_str(value.trim_end_matches('Z'), "%Y-%m-%d %H:%M:%S%.f")
        .map(Some)
        .map_err(|_| ())
}
