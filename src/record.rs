use crate::access::{self, AccessMarkers};
use crate::error::{Error, Result};
use crate::factory::VariantTag;
use crate::gateway::Value;
use crate::geo::GeoPoint;
use crate::identity::{SecurityContext, format_delegated_ids};
use crate::types::{Discriminator, LoginId, RecordId, SecurityId, Table};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard};

/// Number of free-form tag slots on every record.
pub const TAG_COUNT: usize = 10;

pub(crate) const TAG_COLUMNS: [&str; TAG_COUNT] = [
    "tag0", "tag1", "tag2", "tag3", "tag4", "tag5", "tag6", "tag7", "tag8", "tag9",
];

const CONTEXT_VERSION: u32 = 1;

/// The ten tag slots. Empty strings read as unset.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tags([String; TAG_COUNT]);

impl Tags {
    /// Returns a slot, or `None` when the index is out of range or the slot is empty.
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0
            .get(index)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    /// Sets a slot. Out-of-range indexes are rejected.
    pub fn set(&mut self, index: usize, value: impl Into<String>) -> Result<()> {
        let slot = self.0.get_mut(index).ok_or_else(|| {
            Error::InvalidCriteria(format!("tag index {index} must be < {TAG_COUNT}"))
        })?;
        *slot = value.into();
        Ok(())
    }

    pub(crate) fn slots(&self) -> &[String; TAG_COUNT] {
        &self.0
    }

    pub(crate) fn from_slots(slots: [String; TAG_COUNT]) -> Self {
        Self(slots)
    }
}

/// Address parts a place keeps in its tag slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressField {
    Venue,
    StreetAddress,
    ExtraInformation,
    Town,
    County,
    State,
    PostalCode,
    Nation,
}

impl AddressField {
    /// Tag slot holding this field.
    pub const fn tag_index(self) -> usize {
        match self {
            Self::Venue => 0,
            Self::StreetAddress => 1,
            Self::ExtraInformation => 2,
            Self::Town => 3,
            Self::County => 4,
            Self::State => 5,
            Self::PostalCode => 6,
            Self::Nation => 7,
        }
    }
}

/// Variant state stored in the `context` column.
///
/// The column holds a versioned JSON object; collections keep their ordered
/// child ids here, other variants may use `attributes` freely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub(crate) children: Vec<RecordId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Serialize, Deserialize)]
struct StoredContext {
    version: u32,
    #[serde(flatten)]
    body: Context,
}

impl Context {
    /// Ordered child ids. Only collections populate this.
    pub fn children(&self) -> &[RecordId] {
        &self.children
    }

    /// Returns true when there is nothing worth storing.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty() && self.attributes.is_empty()
    }

    pub(crate) fn encode(&self) -> Result<Option<String>> {
        if self.is_empty() {
            return Ok(None);
        }
        let stored = StoredContext {
            version: CONTEXT_VERSION,
            body: self.clone(),
        };
        serde_json::to_string(&stored)
            .map(Some)
            .map_err(|error| Error::Codec(format!("context: {error}")))
    }

    pub(crate) fn decode(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.filter(|raw| !raw.trim().is_empty()) else {
            return Ok(Self::default());
        };
        let stored: StoredContext = serde_json::from_str(raw)
            .map_err(|error| Error::Codec(format!("context: {error}")))?;
        if stored.version > CONTEXT_VERSION {
            return Err(Error::Codec(format!(
                "context version {} is newer than {CONTEXT_VERSION}",
                stored.version
            )));
        }
        Ok(stored.body)
    }
}

/// Raw byte payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload(Vec<u8>);

impl Payload {
    /// Wraps bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Base64-encodes the payload and splits it into chunks of at most
    /// `chunk_len` characters for transport.
    pub fn to_chunks(&self, chunk_len: usize) -> Vec<String> {
        let encoded = BASE64.encode(&self.0);
        if chunk_len == 0 || encoded.is_empty() {
            return vec![encoded];
        }
        // Base64 output is ASCII, so byte chunks are valid strings.
        encoded
            .as_bytes()
            .chunks(chunk_len)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect()
    }

    /// Reassembles a payload from transport chunks.
    pub fn from_chunks<I, S>(chunks: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let joined: String = chunks
            .into_iter()
            .map(|chunk| chunk.as_ref().trim().to_string())
            .collect();
        BASE64
            .decode(joined)
            .map(Self)
            .map_err(|error| Error::Codec(format!("payload: {error}")))
    }
}

/// Kind of security node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    /// A principal that can log in.
    Login,
    /// A permission token that logins are delegated.
    Token,
}

/// State specific to security nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecurityNode {
    pub(crate) kind: NodeKind,
    pub delegated_ids: BTreeSet<SecurityId>,
    pub(crate) login_id: Option<LoginId>,
}

impl SecurityNode {
    /// Login or token.
    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// Link to the login subsystem, for logins.
    pub fn login_id(&self) -> Option<&LoginId> {
        self.login_id.as_ref()
    }
}

/// Concrete record variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Plain record, also the fallback for unknown discriminators.
    Generic,
    /// A location whose tags hold an address.
    Place,
    /// An ordered aggregate of child records.
    Collection,
    /// A login or permission token.
    SecurityNode(SecurityNode),
}

/// A stored row in typed form.
#[derive(Clone, Debug, PartialEq)]
pub struct Record {
    pub(crate) id: Option<RecordId>,
    pub(crate) discriminator: Discriminator,
    pub(crate) variant: Variant,
    pub read_security_id: Option<SecurityId>,
    pub write_security_id: Option<SecurityId>,
    pub owner_id: Option<RecordId>,
    pub name: Option<String>,
    pub tags: Tags,
    pub location: Option<GeoPoint>,
    pub context: Context,
    pub payload: Option<Payload>,
    pub(crate) last_modified: Option<DateTime<Utc>>,
}

impl Record {
    /// Creates an unsaved record of the given variant.
    pub fn new(tag: VariantTag) -> Self {
        let variant = match tag {
            VariantTag::Generic => Variant::Generic,
            VariantTag::Place => Variant::Place,
            VariantTag::Collection => Variant::Collection,
            VariantTag::Login => Variant::SecurityNode(SecurityNode {
                kind: NodeKind::Login,
                delegated_ids: BTreeSet::new(),
                login_id: None,
            }),
            VariantTag::Token => Variant::SecurityNode(SecurityNode {
                kind: NodeKind::Token,
                delegated_ids: BTreeSet::new(),
                login_id: None,
            }),
        };
        Self {
            id: None,
            discriminator: Discriminator::from_string(tag.default_discriminator().to_string()),
            variant,
            read_security_id: None,
            write_security_id: None,
            owner_id: None,
            name: None,
            tags: Tags::default(),
            location: None,
            context: Context::default(),
            payload: None,
            last_modified: None,
        }
    }

    /// Creates an unsaved login linked to the login subsystem.
    pub fn login(login_id: LoginId) -> Self {
        let mut record = Self::new(VariantTag::Login);
        if let Variant::SecurityNode(node) = &mut record.variant {
            node.login_id = Some(login_id);
        }
        record
    }

    /// Overrides the stored discriminator, e.g. with a registered alias.
    pub fn with_discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = discriminator;
        self
    }

    /// Store-assigned id, `None` until first written or after deletion.
    pub fn id(&self) -> Option<RecordId> {
        self.id
    }

    /// Stored discriminator.
    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// Concrete variant.
    pub fn variant(&self) -> &Variant {
        &self.variant
    }

    /// Variant tag.
    pub fn tag(&self) -> VariantTag {
        match &self.variant {
            Variant::Generic => VariantTag::Generic,
            Variant::Place => VariantTag::Place,
            Variant::Collection => VariantTag::Collection,
            Variant::SecurityNode(node) => match node.kind {
                NodeKind::Login => VariantTag::Login,
                NodeKind::Token => VariantTag::Token,
            },
        }
    }

    /// Table this record lives in.
    pub fn table(&self) -> Table {
        self.tag().table()
    }

    /// Time of the last successful write.
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    /// Returns true when the read column carries the lock marker.
    pub fn is_locked(&self) -> bool {
        self.read_security_id == Some(SecurityId::LOCKED)
    }

    /// Returns true for collections.
    pub fn is_collection(&self) -> bool {
        matches!(self.variant, Variant::Collection)
    }

    /// Ordered child ids of a collection. Empty for other variants.
    pub fn child_ids(&self) -> &[RecordId] {
        self.context.children()
    }

    /// Security node state, for logins and tokens.
    pub fn security_node(&self) -> Option<&SecurityNode> {
        match &self.variant {
            Variant::SecurityNode(node) => Some(node),
            _ => None,
        }
    }

    /// Mutable security node state, for logins and tokens.
    pub fn security_node_mut(&mut self) -> Option<&mut SecurityNode> {
        match &mut self.variant {
            Variant::SecurityNode(node) => Some(node),
            _ => None,
        }
    }

    /// Reads an address field from the tag slots.
    pub fn address_field(&self, field: AddressField) -> Option<&str> {
        self.tags.get(field.tag_index())
    }

    /// Writes an address field into the tag slots.
    pub fn set_address_field(&mut self, field: AddressField, value: impl Into<String>) {
        self.tags.0[field.tag_index()] = value.into();
    }

    /// Comma-separated address made from the non-empty address fields.
    pub fn formatted_address(&self) -> String {
        [
            AddressField::Venue,
            AddressField::StreetAddress,
            AddressField::Town,
            AddressField::County,
            AddressField::State,
            AddressField::PostalCode,
            AddressField::Nation,
        ]
        .into_iter()
        .filter_map(|field| self.address_field(field))
        .collect::<Vec<_>>()
        .join(", ")
    }

    /// Permission columns for access checks.
    pub fn markers(&self) -> AccessMarkers {
        AccessMarkers {
            table: self.table(),
            id: self.id.map(RecordId::get),
            read: self.read_security_id,
            write: self.write_security_id,
        }
    }

    /// Returns true when `context` may see this record.
    pub fn can_read(&self, context: &SecurityContext) -> bool {
        access::can_read(context, &self.markers())
    }

    /// Returns true when `context` may modify this record.
    pub fn can_write(&self, context: &SecurityContext) -> bool {
        access::can_write(context, &self.markers())
    }

    /// Column values to persist, excluding `id` and `last_modified`.
    pub(crate) fn to_columns(&self) -> Result<Vec<(&'static str, Value)>> {
        let mut columns = vec![
            (
                "type_discriminator",
                Value::Text(self.discriminator.as_str().to_string()),
            ),
            (
                "read_security_id",
                Value::from(self.read_security_id.map(SecurityId::get)),
            ),
            (
                "write_security_id",
                Value::from(self.write_security_id.map(SecurityId::get)),
            ),
            ("owner_id", Value::from(self.owner_id.map(RecordId::get))),
            ("name", Value::from(self.name.clone())),
        ];
        for (column, value) in TAG_COLUMNS.into_iter().zip(self.tags.slots()) {
            let value = if value.is_empty() {
                Value::Null
            } else {
                Value::Text(value.clone())
            };
            columns.push((column, value));
        }
        columns.push((
            "latitude",
            Value::from(self.location.map(|point| point.latitude())),
        ));
        columns.push((
            "longitude",
            Value::from(self.location.map(|point| point.longitude())),
        ));
        columns.push(("context", Value::from(self.context.encode()?)));
        columns.push((
            "payload",
            self.payload
                .as_ref()
                .map_or(Value::Null, |payload| Value::Blob(payload.0.clone())),
        ));
        if let Variant::SecurityNode(node) = &self.variant {
            columns.push((
                "delegated_ids",
                Value::Text(format_delegated_ids(&node.delegated_ids)),
            ));
            columns.push((
                "login_id",
                Value::from(node.login_id.as_ref().map(|login| login.as_str().to_string())),
            ));
        }
        Ok(columns)
    }
}

/// Shared, session-scoped instance of a record.
///
/// Every fetch of the same row within one session yields a clone of the same
/// handle, so changes made through one are visible through all of them.
#[derive(Clone, Debug)]
pub struct RecordHandle(Arc<RwLock<Record>>);

impl RecordHandle {
    /// Wraps a record.
    pub fn new(record: Record) -> Self {
        Self(Arc::new(RwLock::new(record)))
    }

    /// Borrows the record.
    pub fn read(&self) -> RwLockReadGuard<'_, Record> {
        self.0.read().expect("poisoned lock")
    }

    /// Copies the record out.
    pub fn snapshot(&self) -> Record {
        self.read().clone()
    }

    /// Mutates the record in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut Record) -> R) -> R {
        let mut guard = self.0.write().expect("poisoned lock");
        f(&mut guard)
    }

    /// Current id.
    pub fn id(&self) -> Option<RecordId> {
        self.read().id
    }

    /// Returns true when both handles point at the same instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn replace(&self, record: Record) {
        self.update(|current| *current = record);
    }
}

impl From<Record> for RecordHandle {
    fn from(record: Record) -> Self {
        Self::new(record)
    }
}
