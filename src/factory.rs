use crate::error::{Error, Result};
use crate::gateway::Row;
use crate::geo::GeoPoint;
use crate::identity::parse_delegated_ids;
use crate::record::{Context, Payload, Record, SecurityNode, TAG_COLUMNS, TAG_COUNT, Tags, Variant};
use crate::types::{Discriminator, LoginId, RecordId, SecurityId, Table};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Closed set of record variants the factory can build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariantTag {
    Generic,
    Place,
    Collection,
    Login,
    Token,
}

impl VariantTag {
    /// Discriminator written for new records of this variant.
    pub const fn default_discriminator(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::Place => "place",
            Self::Collection => "collection",
            Self::Login => "login",
            Self::Token => "token",
        }
    }

    /// Table rows of this variant live in.
    pub const fn table(self) -> Table {
        match self {
            Self::Login | Self::Token => Table::SecurityNodes,
            Self::Generic | Self::Place | Self::Collection => Table::Records,
        }
    }

    const ALL: [Self; 5] = [
        Self::Generic,
        Self::Place,
        Self::Collection,
        Self::Login,
        Self::Token,
    ];
}

/// Maps stored discriminators to variant tags.
///
/// Unknown discriminators in the records table resolve to the fallback
/// variant (generic by default). Security nodes have no fallback: a row there
/// must be a login or a token.
#[derive(Clone, Debug)]
pub struct VariantRegistry {
    entries: HashMap<Discriminator, VariantTag>,
    fallback: Option<VariantTag>,
}

impl Default for VariantRegistry {
    fn default() -> Self {
        let entries = VariantTag::ALL
            .into_iter()
            .map(|tag| {
                (
                    Discriminator::from_string(tag.default_discriminator().to_string()),
                    tag,
                )
            })
            .collect();
        Self {
            entries,
            fallback: Some(VariantTag::Generic),
        }
    }
}

impl VariantRegistry {
    /// Registers an alias discriminator for a variant.
    pub fn register(mut self, discriminator: Discriminator, tag: VariantTag) -> Self {
        self.entries.insert(discriminator, tag);
        self
    }

    /// Sets or clears the records-table fallback.
    pub fn fallback(mut self, tag: Option<VariantTag>) -> Self {
        self.fallback = tag.filter(|tag| tag.table() == Table::Records);
        self
    }

    /// Resolves a discriminator read from `table`.
    pub fn resolve(&self, table: Table, discriminator: &str) -> Result<VariantTag> {
        let known = Discriminator::new(discriminator)
            .ok()
            .and_then(|discriminator| self.entries.get(&discriminator).copied())
            .filter(|tag| tag.table() == table);
        let fallback = match table {
            Table::Records => self.fallback,
            Table::SecurityNodes => None,
        };
        known.or(fallback).ok_or_else(|| Error::RecordTypeUnresolved {
            table,
            discriminator: discriminator.to_string(),
        })
    }

    /// Builds a typed record from a raw row.
    pub fn decode(&self, table: Table, row: &Row) -> Result<Record> {
        let raw_discriminator = row.get_str("type_discriminator").unwrap_or_default();
        let tag = self.resolve(table, raw_discriminator)?;
        let mut record = Record::new(tag);

        let id = row
            .get_i64("id")
            .ok_or_else(|| Error::Codec(format!("{table} row without id")))?;
        record.id = Some(RecordId::new(id)?);
        if let Ok(discriminator) = Discriminator::new(raw_discriminator) {
            record.discriminator = discriminator;
        }
        record.read_security_id = row.get_i64("read_security_id").map(SecurityId::new);
        record.write_security_id = row.get_i64("write_security_id").map(SecurityId::new);
        record.owner_id = row.get_i64("owner_id").and_then(|id| RecordId::new(id).ok());
        record.name = row.get_str("name").map(str::to_string);

        let mut slots: [String; TAG_COUNT] = Default::default();
        for (slot, column) in slots.iter_mut().zip(TAG_COLUMNS) {
            if let Some(value) = row.get_str(column) {
                *slot = value.to_string();
            }
        }
        record.tags = Tags::from_slots(slots);

        record.location = match (row.get_f64("latitude"), row.get_f64("longitude")) {
            (Some(latitude), Some(longitude)) => GeoPoint::new(latitude, longitude).ok(),
            _ => None,
        };
        record.context = Context::decode(row.get_str("context"))?;
        record.payload = row.get_blob("payload").map(Payload::new);
        record.last_modified = row
            .get_i64("last_modified")
            .and_then(DateTime::<Utc>::from_timestamp_micros);

        if let Variant::SecurityNode(node) = &mut record.variant {
            decode_security_node(node, row);
        }
        Ok(record)
    }
}

fn decode_security_node(node: &mut SecurityNode, row: &Row) {
    node.delegated_ids = row
        .get_str("delegated_ids")
        .map(parse_delegated_ids)
        .unwrap_or_default();
    node.login_id = row
        .get_str("login_id")
        .and_then(|login| LoginId::new(login).ok());
}
