//! Flavour registry: canonical facet names, built-in vocabularies, and
//! user-defined mappings.
//!
//! Every query and every stored document uses the canonical field set
//! internally. A *flavour* is an injective partial mapping from canonical
//! fields to vocabulary-specific names: queries are translated *in*
//! (flavour → canonical) before they reach the search backend, documents are
//! translated *out* (canonical → flavour) before they reach the client.
//! Fields outside the mapping pass through under their canonical name, which
//! is what makes extended search work.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::docstore::DocStore;
use crate::error::{ApiError, ApiResult};

/// The ordered canonical field set. Every search document exposes exactly
/// these fields (absent = null).
pub const CANONICAL_FIELDS: &[&str] = &[
    "project",
    "product",
    "institute",
    "model",
    "experiment",
    "ensemble",
    "realm",
    "variable",
    "time_frequency",
    "time_aggregation",
    "cmor_table",
    "grid_label",
    "grid_id",
    "level_type",
    "format",
    "dataset",
    "driving_model",
    "rcm_name",
    "rcm_version",
    "fs_type",
    "file",
    "uri",
    "time",
    "bbox",
    "version",
    "user",
];

/// Canonical fields that take part in facet aggregation. The primary and
/// range fields (`file`, `uri`, `time`, `bbox`, `version`, `user`) are
/// searchable but not faceted by default.
pub const FACET_FIELDS: &[&str] = &[
    "project",
    "product",
    "institute",
    "model",
    "experiment",
    "ensemble",
    "realm",
    "variable",
    "time_frequency",
    "time_aggregation",
    "cmor_table",
    "grid_label",
    "grid_id",
    "level_type",
    "format",
    "dataset",
    "driving_model",
    "rcm_name",
    "rcm_version",
    "fs_type",
];

/// Whether `name` is a canonical field.
pub fn is_canonical(name: &str) -> bool {
    CANONICAL_FIELDS.contains(&name)
}

/// The six immutable built-in vocabularies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltInFlavour {
    Cmip5,
    Cmip6,
    Cordex,
    Freva,
    NextGems,
    User,
}

impl BuiltInFlavour {
    /// All built-ins, in their published order.
    pub const ALL: &'static [BuiltInFlavour] = &[
        Self::Cmip5,
        Self::Cmip6,
        Self::Cordex,
        Self::Freva,
        Self::NextGems,
        Self::User,
    ];

    /// Published name of the flavour.
    pub fn name(self) -> &'static str {
        match self {
            Self::Cmip5 => "cmip5",
            Self::Cmip6 => "cmip6",
            Self::Cordex => "cordex",
            Self::Freva => "freva",
            Self::NextGems => "nextgems",
            Self::User => "user",
        }
    }

    /// Parse a built-in flavour name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.name() == name)
    }

    /// The canonical → flavour renames. Canonical fields not listed here are
    /// exposed under their canonical name.
    fn renames(self) -> &'static [(&'static str, &'static str)] {
        match self {
            // The freva vocabulary is the canonical one.
            Self::Freva | Self::User => &[],
            Self::Cmip5 => &[("realm", "modeling_realm")],
            Self::Cmip6 => &[
                ("project", "mip_era"),
                ("product", "activity_id"),
                ("institute", "institution_id"),
                ("model", "source_id"),
                ("experiment", "experiment_id"),
                ("ensemble", "member_id"),
                ("variable", "variable_id"),
                ("time_frequency", "frequency"),
                ("cmor_table", "table_id"),
            ],
            Self::Cordex => &[
                ("product", "domain"),
                ("model", "rcm_name"),
                ("institute", "institution"),
                ("ensemble", "driving_model_ensemble_member"),
                ("driving_model", "driving_model_id"),
            ],
            Self::NextGems => &[
                ("institute", "institution_id"),
                ("model", "source_id"),
                ("experiment", "experiment_id"),
                ("ensemble", "member_id"),
                ("variable", "variable_id"),
                ("time_aggregation", "time_reduction"),
            ],
        }
    }
}

/// A stored flavour definition: built-ins are materialised from the constant
/// tables, user flavours come from the document store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FlavourDef {
    pub name: String,
    /// `"global"` or the owning username.
    pub owner: String,
    /// Canonical field → flavour-specific name.
    pub mapping: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl FlavourDef {
    fn from_builtin(b: BuiltInFlavour) -> Self {
        Self {
            name: b.name().to_string(),
            owner: "global".to_string(),
            mapping: b
                .renames()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// Resolved flavour handle: either one of the built-ins or a user-defined
/// vocabulary.
#[derive(Clone, Debug)]
pub enum Flavour {
    BuiltIn(BuiltInFlavour),
    UserDefined(Arc<FlavourDef>),
}

impl Flavour {
    /// Published name.
    pub fn name(&self) -> &str {
        match self {
            Self::BuiltIn(b) => b.name(),
            Self::UserDefined(def) => &def.name,
        }
    }

    /// Canonical → flavour name, or `None` when the field passes through.
    pub fn forward(&self, canonical: &str) -> Option<&str> {
        match self {
            Self::BuiltIn(b) => b
                .renames()
                .iter()
                .find(|(c, _)| *c == canonical)
                .map(|(_, v)| *v),
            Self::UserDefined(def) => def.mapping.get(canonical).map(String::as_str),
        }
    }

    /// Flavour name → canonical, or `None` when unknown to the mapping.
    pub fn reverse(&self, flavoured: &str) -> Option<&str> {
        match self {
            Self::BuiltIn(b) => b
                .renames()
                .iter()
                .find(|(_, v)| *v == flavoured)
                .map(|(c, _)| *c),
            Self::UserDefined(def) => def
                .mapping
                .iter()
                .find(|(_, v)| v.as_str() == flavoured)
                .map(|(c, _)| c.as_str()),
        }
    }

    /// Translate an inbound query key to its canonical form.
    ///
    /// A key is accepted if it is a flavour-specific name from the mapping or
    /// already canonical; everything else is an invalid facet. Renamed
    /// canonical fields stay addressable under the flavour name only, so a
    /// cmip6 query must say `source_id`, not `model`.
    pub fn key_in(&self, key: &str) -> ApiResult<String> {
        if let Some(canonical) = self.reverse(key) {
            return Ok(canonical.to_string());
        }
        if is_canonical(key) && self.forward(key).is_none() {
            return Ok(key.to_string());
        }
        Err(ApiError::InvalidInput(format!(
            "{key}: not a valid search facet for flavour {}",
            self.name()
        )))
    }

    /// Translate an outbound canonical field name to the flavour vocabulary.
    pub fn key_out<'a>(&'a self, canonical: &'a str) -> &'a str {
        self.forward(canonical).unwrap_or(canonical)
    }

    /// Translate a whole key/value sequence inbound. Values pass through
    /// untouched, wildcard and regex syntax included.
    pub fn translate_in(
        &self,
        pairs: impl IntoIterator<Item = (String, String)>,
    ) -> ApiResult<Vec<(String, String)>> {
        pairs
            .into_iter()
            .map(|(k, v)| {
                // `_not_` negation markers ride along on the key.
                let (bare, negated) = match k.strip_suffix("_not_") {
                    Some(b) => (b, true),
                    None => (k.as_str(), false),
                };
                let canonical = self.key_in(bare)?;
                let key = if negated { format!("{canonical}_not_") } else { canonical };
                Ok((key, v))
            })
            .collect()
    }

    /// Translate a document's field names outbound, leaving values alone.
    pub fn translate_out(
        &self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> serde_json::Map<String, serde_json::Value> {
        doc.iter()
            .map(|(k, v)| (self.key_out(k).to_string(), v.clone()))
            .collect()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Read-mostly registry over the built-in tables and the `user_flavours`
/// collection. The cache is an atomically swapped snapshot, reloaded after
/// every successful write.
pub struct FlavourRegistry {
    store: DocStore,
    cache: RwLock<Arc<Vec<FlavourDef>>>,
}

/// Payload for flavour create/update calls.
#[derive(Debug, Deserialize)]
pub struct FlavourUpsert {
    /// New name; on update this renames the flavour.
    pub flavour_name: Option<String>,
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
    /// Create/update the global copy instead of the caller's (admins only).
    #[serde(default)]
    pub global: bool,
}

fn validate_mapping(mapping: &BTreeMap<String, String>) -> ApiResult<()> {
    let mut seen = std::collections::BTreeSet::new();
    for (key, value) in mapping {
        if !is_canonical(key) {
            return Err(ApiError::InvalidInput(format!(
                "{key}: not a canonical field"
            )));
        }
        if value.is_empty() {
            return Err(ApiError::InvalidInput(format!("{key}: empty target name")));
        }
        if !seen.insert(value.as_str()) {
            return Err(ApiError::InvalidInput(format!(
                "{value}: mapped from more than one canonical field"
            )));
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> ApiResult<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ApiError::InvalidInput(format!(
            "{name}: flavour names are alphanumeric plus '-'/'_'"
        )))
    }
}

impl FlavourRegistry {
    pub fn new(store: DocStore) -> Self {
        Self {
            store,
            cache: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Load the user-flavour snapshot from the document store. Called at
    /// startup and after every write.
    pub async fn refresh(&self) -> ApiResult<()> {
        let defs: Vec<FlavourDef> = self.store.find_all("user_flavours").await?;
        *self.cache.write().expect("flavour cache poisoned") = Arc::new(defs);
        Ok(())
    }

    fn snapshot(&self) -> Arc<Vec<FlavourDef>> {
        self.cache.read().expect("flavour cache poisoned").clone()
    }

    /// Resolve a flavour name for a caller. Precedence: built-in, then the
    /// caller's own definition, then a global one.
    pub fn resolve(&self, name: &str, principal: Option<&Principal>) -> ApiResult<Flavour> {
        if let Some(b) = BuiltInFlavour::parse(name) {
            return Ok(Flavour::BuiltIn(b));
        }
        let snapshot = self.snapshot();
        let username = principal.map(|p| p.username.as_str());
        let found = snapshot
            .iter()
            .find(|d| d.name == name && Some(d.owner.as_str()) == username)
            .or_else(|| snapshot.iter().find(|d| d.name == name && d.owner == "global"));
        match found {
            Some(def) => Ok(Flavour::UserDefined(Arc::new(def.clone()))),
            None => Err(ApiError::NotFound(format!("flavour {name} not known"))),
        }
    }

    /// All flavours visible to a caller (built-ins, global, own).
    pub fn list(&self, principal: Option<&Principal>) -> Vec<FlavourDef> {
        let mut out: Vec<FlavourDef> = BuiltInFlavour::ALL
            .iter()
            .map(|b| FlavourDef::from_builtin(*b))
            .collect();
        let username = principal.map(|p| p.username.as_str());
        for def in self.snapshot().iter() {
            if def.owner == "global" || Some(def.owner.as_str()) == username {
                out.push(def.clone());
            }
        }
        out
    }

    fn owner_for_write(principal: &Principal, global: bool) -> ApiResult<String> {
        if global {
            if !principal.is_admin {
                return Err(ApiError::Forbidden(
                    "only admins may write global flavours".into(),
                ));
            }
            Ok("global".to_string())
        } else {
            Ok(principal.username.clone())
        }
    }

    fn exists(&self, name: &str, owner: &str) -> bool {
        self.snapshot()
            .iter()
            .any(|d| d.name == name && d.owner == owner)
    }

    /// Create a new flavour. Built-in names and `(name, owner)` collisions
    /// are rejected.
    pub async fn create(
        &self,
        principal: &Principal,
        name: &str,
        req: FlavourUpsert,
    ) -> ApiResult<FlavourDef> {
        validate_name(name)?;
        validate_mapping(&req.mapping)?;
        if BuiltInFlavour::parse(name).is_some() {
            return Err(ApiError::Immutable(format!("{name} is a built-in flavour")));
        }
        let owner = Self::owner_for_write(principal, req.global)?;
        if self.exists(name, &owner) {
            return Err(ApiError::Conflict(format!(
                "flavour {name} already exists for {owner}"
            )));
        }
        let def = FlavourDef {
            name: name.to_string(),
            owner,
            mapping: req.mapping,
            created_at: Utc::now(),
        };
        self.store.insert_one("user_flavours", &def).await?;
        self.refresh().await?;
        Ok(def)
    }

    /// Update (and possibly rename) an existing flavour. Unchanged mapping
    /// keys retain their prior values; a rename must not collide.
    pub async fn update(
        &self,
        principal: &Principal,
        name: &str,
        req: FlavourUpsert,
    ) -> ApiResult<FlavourDef> {
        if BuiltInFlavour::parse(name).is_some() {
            return Err(ApiError::Immutable(format!("{name} is a built-in flavour")));
        }
        validate_mapping(&req.mapping)?;
        let owner = Self::owner_for_write(principal, req.global)?;
        let current = self
            .snapshot()
            .iter()
            .find(|d| d.name == name && d.owner == owner)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("flavour {name} not known")))?;

        let new_name = match req.flavour_name.as_deref() {
            Some(n) if n != name => {
                validate_name(n)?;
                if BuiltInFlavour::parse(n).is_some() {
                    return Err(ApiError::Immutable(format!("{n} is a built-in flavour")));
                }
                if self.exists(n, &owner) {
                    return Err(ApiError::Conflict(format!(
                        "flavour {n} already exists for {owner}"
                    )));
                }
                n.to_string()
            }
            _ => name.to_string(),
        };

        let mut mapping = current.mapping.clone();
        mapping.extend(req.mapping);
        validate_mapping(&mapping)?;

        let def = FlavourDef {
            name: new_name,
            owner: owner.clone(),
            mapping,
            created_at: current.created_at,
        };
        self.store
            .replace_one(
                "user_flavours",
                serde_json::json!({ "name": name, "owner": owner }),
                &def,
            )
            .await?;
        self.refresh().await?;
        Ok(def)
    }

    /// Delete a flavour. Built-ins are immutable.
    pub async fn delete(&self, principal: &Principal, name: &str, global: bool) -> ApiResult<()> {
        if BuiltInFlavour::parse(name).is_some() {
            return Err(ApiError::Immutable(format!("{name} is a built-in flavour")));
        }
        let owner = Self::owner_for_write(principal, global)?;
        if !self.exists(name, &owner) {
            return Err(ApiError::NotFound(format!("flavour {name} not known")));
        }
        self.store
            .delete_many(
                "user_flavours",
                serde_json::json!({ "name": name, "owner": owner }),
            )
            .await?;
        self.refresh().await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_set_is_lowercase_and_unique() {
        let mut seen = std::collections::BTreeSet::new();
        for f in CANONICAL_FIELDS {
            assert_eq!(*f, f.to_lowercase());
            assert!(seen.insert(*f), "duplicate canonical field {f}");
        }
        for f in FACET_FIELDS {
            assert!(is_canonical(f));
        }
    }

    #[test]
    fn builtin_mappings_are_injective_subsets() {
        for b in BuiltInFlavour::ALL {
            let mut targets = std::collections::BTreeSet::new();
            for (canonical, target) in b.renames() {
                assert!(is_canonical(canonical), "{canonical} not canonical in {b:?}");
                assert!(targets.insert(*target), "duplicate target {target} in {b:?}");
            }
        }
    }

    #[test]
    fn cmip6_translates_both_ways() {
        let f = Flavour::BuiltIn(BuiltInFlavour::Cmip6);
        assert_eq!(f.key_in("source_id").unwrap(), "model");
        assert_eq!(f.key_out("model"), "source_id");
        // Unmapped canonical names pass through for extended search.
        assert_eq!(f.key_in("grid_label").unwrap(), "grid_label");
        // The canonical name of a renamed field is no longer addressable.
        assert!(f.key_in("model").is_err());
        assert!(f.key_in("flurb").is_err());
    }

    #[test]
    fn round_trip_restricted_to_mapped_fields() {
        for b in BuiltInFlavour::ALL {
            let f = Flavour::BuiltIn(*b);
            for canonical in CANONICAL_FIELDS {
                let out = f.key_out(canonical);
                assert_eq!(f.key_in(out).unwrap(), *canonical);
            }
        }
    }

    #[test]
    fn negated_keys_keep_their_marker() {
        let f = Flavour::BuiltIn(BuiltInFlavour::Cmip6);
        let pairs = vec![("source_id_not_".to_string(), "mpi*".to_string())];
        let translated = f.translate_in(pairs).unwrap();
        assert_eq!(translated, vec![("model_not_".to_string(), "mpi*".to_string())]);
    }

    #[test]
    fn translate_out_renames_document_keys() {
        let f = Flavour::BuiltIn(BuiltInFlavour::Cmip6);
        let doc: serde_json::Map<String, serde_json::Value> = serde_json::from_value(
            serde_json::json!({ "model": ["mpi-esm"], "file": "/a.nc" }),
        )
        .unwrap();
        let out = f.translate_out(&doc);
        assert!(out.contains_key("source_id"));
        assert!(out.contains_key("file"));
        assert!(!out.contains_key("model"));
    }

    #[test]
    fn mapping_validation_rejects_bad_input() {
        let mut m = BTreeMap::new();
        m.insert("not_a_field".to_string(), "x".to_string());
        assert!(validate_mapping(&m).is_err());

        let mut m = BTreeMap::new();
        m.insert("model".to_string(), "same".to_string());
        m.insert("institute".to_string(), "same".to_string());
        assert!(validate_mapping(&m).is_err());

        assert!(validate_name("my-flavour").is_ok());
        assert!(validate_name("bad name").is_err());
    }
}
