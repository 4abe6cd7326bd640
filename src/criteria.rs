use crate::error::{Error, Result};
use crate::gateway::Value;
use crate::geo::{LocationSearch, bounding_box};
use crate::predicate::Fragment;
use crate::record::{TAG_COLUMNS, TAG_COUNT};
use crate::types::{Discriminator, RecordId};

/// How separate criteria fields combine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SearchMode {
    /// Every field must match (`AND`).
    #[default]
    Narrow,
    /// Any field may match (`OR`).
    Wide,
}

/// Access level a fetch requires.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Access {
    #[default]
    Read,
    Write,
}

/// Shape of a search result.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Projection {
    #[default]
    Records,
    Ids,
    Count,
}

/// One page of results.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    pub size: usize,
    /// Zero-based page number.
    pub index: usize,
}

/// What to match. Values within one field are OR'd together.
///
/// Tag criteria always OR with each other, whatever the [`SearchMode`]; the
/// group as a whole then joins the other fields like any single field.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SearchCriteria {
    pub ids: Vec<RecordId>,
    pub types: Vec<Discriminator>,
    pub names: Vec<String>,
    pub owners: Vec<RecordId>,
    pub tags: [Vec<String>; TAG_COUNT],
    pub location: Option<LocationSearch>,
}

impl SearchCriteria {
    /// Creates empty criteria, which match every visible row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an id.
    pub fn id(mut self, id: RecordId) -> Self {
        self.ids.push(id);
        self
    }

    /// Adds a discriminator.
    pub fn type_name(mut self, discriminator: Discriminator) -> Self {
        self.types.push(discriminator);
        self
    }

    /// Adds a name pattern.
    pub fn name(mut self, pattern: impl Into<String>) -> Self {
        self.names.push(pattern.into());
        self
    }

    /// Adds an owner id.
    pub fn owner(mut self, owner: RecordId) -> Self {
        self.owners.push(owner);
        self
    }

    /// Adds a pattern for tag slot `index`.
    pub fn tag(mut self, index: usize, pattern: impl Into<String>) -> Result<Self> {
        let slot = self.tags.get_mut(index).ok_or_else(|| {
            Error::InvalidCriteria(format!("tag index {index} must be < {TAG_COUNT}"))
        })?;
        slot.push(pattern.into());
        Ok(self)
    }

    /// Restricts results to a search circle.
    pub fn near(mut self, location: LocationSearch) -> Self {
        self.location = Some(location);
        self
    }

    /// Non-location criteria as one fragment.
    pub(crate) fn to_fragment(&self, mode: SearchMode) -> Fragment {
        let mut fields = Vec::new();
        if !self.ids.is_empty() {
            fields.push(Fragment::in_list(
                "id",
                self.ids.iter().map(|id| Value::Integer(id.get())),
            ));
        }
        if !self.types.is_empty() {
            fields.push(Fragment::any(
                self.types
                    .iter()
                    .map(|discriminator| text_match("type_discriminator", discriminator.as_str())),
            ));
        }
        if !self.names.is_empty() {
            fields.push(Fragment::any(
                self.names.iter().map(|pattern| text_match("name", pattern)),
            ));
        }
        if !self.owners.is_empty() {
            fields.push(Fragment::in_list(
                "owner_id",
                self.owners.iter().map(|id| Value::Integer(id.get())),
            ));
        }
        let tag_matches: Vec<Fragment> = TAG_COLUMNS
            .into_iter()
            .zip(&self.tags)
            .flat_map(|(column, patterns)| {
                patterns.iter().map(move |pattern| text_match(column, pattern))
            })
            .collect();
        if !tag_matches.is_empty() {
            fields.push(Fragment::any(tag_matches));
        }

        match mode {
            SearchMode::Narrow => Fragment::all(fields),
            SearchMode::Wide if fields.is_empty() => Fragment::always(),
            SearchMode::Wide => Fragment::any(fields),
        }
    }
}

/// Case-insensitive match of `column` against `pattern`.
///
/// `%` makes the pattern a wildcard; a lone `%` means "not empty" and an
/// empty pattern means "NULL or empty". `_` and `\` always match literally.
pub(crate) fn text_match(column: &str, pattern: &str) -> Fragment {
    if pattern.is_empty() {
        return Fragment::new(format!("{column} IS NULL OR {column} = ''"), Vec::new());
    }
    if pattern == "%" {
        return Fragment::new(
            format!("{column} IS NOT NULL AND {column} <> ''"),
            Vec::new(),
        );
    }
    let folded = pattern.to_lowercase();
    if folded.contains('%') {
        let escaped = folded.replace('\\', "\\\\").replace('_', "\\_");
        Fragment::new(
            format!("LOWER({column}) LIKE ? ESCAPE '\\'"),
            vec![Value::Text(escaped)],
        )
    } else {
        Fragment::new(format!("LOWER({column}) = ?"), vec![Value::Text(folded)])
    }
}

/// Phase-one location filter: bounding box plus inflated spherical radius.
pub(crate) fn location_fragment(search: &LocationSearch, inflation: f64) -> Fragment {
    let radius = search.radius_km * inflation;
    let bounds = bounding_box(search.center, radius);
    let mut parts = vec![Fragment::new(
        "latitude IS NOT NULL AND longitude IS NOT NULL AND latitude BETWEEN ? AND ?",
        vec![
            Value::Real(bounds.min_latitude),
            Value::Real(bounds.max_latitude),
        ],
    )];
    if let Some((west, east)) = bounds.longitude {
        parts.push(Fragment::new(
            "longitude BETWEEN ? AND ?",
            vec![Value::Real(west), Value::Real(east)],
        ));
    }
    parts.push(Fragment::new(
        format!("{} <= ?", distance_expression()),
        vec![
            Value::Real(search.center.latitude()),
            Value::Real(search.center.longitude()),
            Value::Real(radius),
        ],
    ));
    Fragment::all(parts)
}

/// SQL expression for the spherical distance from two bound parameters
/// (center latitude, center longitude) to the row's coordinates.
pub(crate) fn distance_expression() -> &'static str {
    "geo_distance_km(?, ?, latitude, longitude)"
}

/// Options that shape a search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub access: Access,
    pub projection: Projection,
    pub page: Option<Page>,
}

impl SearchOptions {
    /// Default options: narrow, read access, full records, no paging.
    pub fn new() -> Self {
        Self::default()
    }

    /// OR the criteria fields together.
    pub fn wide(mut self) -> Self {
        self.mode = SearchMode::Wide;
        self
    }

    /// Only return rows the caller can write.
    pub fn write_only(mut self) -> Self {
        self.access = Access::Write;
        self
    }

    /// Return ids instead of records.
    pub fn ids_only(mut self) -> Self {
        self.projection = Projection::Ids;
        self
    }

    /// Return a count instead of records.
    pub fn count_only(mut self) -> Self {
        self.projection = Projection::Count;
        self
    }

    /// Return one page of results.
    pub fn page(mut self, size: usize, index: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidCriteria("page size must be positive".into()));
        }
        self.page = Some(Page { size, index });
        Ok(self)
    }
}
