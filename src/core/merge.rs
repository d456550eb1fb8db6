//! Product merger: assembles one target product from several sources.
//!
//! Each source is copied under an explicit [`SelectionPolicy`]. Nothing is
//! copied implicitly, and a band may only replace an already merged band of
//! the same name when the policy lists it as an override.

use crate::types::{Product, SnowError, SnowResult};

/// Which bands of a source to copy
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BandSelection {
    #[default]
    None,
    All,
    Only(Vec<String>),
}

/// What to take from one source product
#[derive(Debug, Clone, Default)]
pub struct SelectionPolicy {
    pub metadata: bool,
    pub geocoding: bool,
    pub time: bool,
    pub flag_codings: bool,
    /// Copy every band carrying a flag coding (implies `flag_codings`)
    pub flag_bands: bool,
    pub masks: bool,
    pub tie_point_grids: bool,
    pub bands: BandSelection,
    /// Band names allowed to replace an already merged band
    pub overrides: Vec<String>,
}

impl SelectionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metadata, geocoding, time, flag codings, flag bands, masks and
    /// tie-point grids
    pub fn everything_but_bands() -> Self {
        Self {
            metadata: true,
            geocoding: true,
            time: true,
            flag_codings: true,
            flag_bands: true,
            masks: true,
            tie_point_grids: true,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self) -> Self {
        self.metadata = true;
        self
    }

    pub fn with_geocoding(mut self) -> Self {
        self.geocoding = true;
        self
    }

    pub fn with_time(mut self) -> Self {
        self.time = true;
        self
    }

    pub fn with_flag_codings(mut self) -> Self {
        self.flag_codings = true;
        self
    }

    pub fn with_flag_bands(mut self) -> Self {
        self.flag_codings = true;
        self.flag_bands = true;
        self
    }

    pub fn with_masks(mut self) -> Self {
        self.masks = true;
        self
    }

    pub fn with_tie_point_grids(mut self) -> Self {
        self.tie_point_grids = true;
        self
    }

    pub fn with_all_bands(mut self) -> Self {
        self.bands = BandSelection::All;
        self
    }

    /// Add bands to an explicit selection
    pub fn with_bands<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selected = match std::mem::take(&mut self.bands) {
            BandSelection::Only(existing) => existing,
            _ => Vec::new(),
        };
        selected.extend(names.into_iter().map(Into::into));
        self.bands = BandSelection::Only(selected);
        self
    }

    /// Copy `name` and let it replace a band merged earlier
    pub fn with_override(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self = self.with_bands([name.clone()]);
        self.overrides.push(name);
        self
    }
}

/// Builds a target product from an ordered list of sources
#[derive(Debug, Clone)]
pub struct ProductMerger {
    target: Product,
}

impl ProductMerger {
    pub fn new(
        name: impl Into<String>,
        product_type: impl Into<String>,
        width: usize,
        height: usize,
    ) -> Self {
        Self {
            target: Product::new(name, product_type, width, height),
        }
    }

    /// Start from an existing shell product
    pub fn from_target(target: Product) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &Product {
        &self.target
    }

    pub fn finish(self) -> Product {
        self.target
    }

    /// Merge every source in order and return the target
    pub fn merge(mut self, sources: &[(&Product, SelectionPolicy)]) -> SnowResult<Product> {
        for (source, policy) in sources {
            self.add(source, policy)?;
        }
        Ok(self.target)
    }

    /// Merge one source into the target
    pub fn add(&mut self, source: &Product, policy: &SelectionPolicy) -> SnowResult<()> {
        if source.raster_size() != self.target.raster_size() {
            return Err(SnowError::Definition(format!(
                "cannot merge '{}' ({}x{}) into '{}' ({}x{})",
                source.name,
                source.width(),
                source.height(),
                self.target.name,
                self.target.width(),
                self.target.height()
            )));
        }

        if policy.metadata {
            self.target.metadata.union_with(&source.metadata);
        }

        if policy.geocoding {
            if let Some(geocoding) = &source.geocoding {
                match &self.target.geocoding {
                    None => self.target.geocoding = Some(geocoding.clone()),
                    Some(existing) if existing == geocoding => {}
                    Some(_) => {
                        return Err(SnowError::Definition(format!(
                            "geocoding of '{}' conflicts with '{}'",
                            source.name, self.target.name
                        )));
                    }
                }
            }
        }

        if policy.time {
            if self.target.start_time.is_none() {
                self.target.start_time = source.start_time;
            }
            if self.target.end_time.is_none() {
                self.target.end_time = source.end_time;
            }
        }

        if policy.flag_codings || policy.flag_bands {
            self.target.flag_codings.compose(&source.flag_codings)?;
        }

        let mut selected: Vec<&str> = Vec::new();
        if policy.flag_bands {
            selected.extend(source.flag_bands().map(|b| b.name.as_str()));
        }
        match &policy.bands {
            BandSelection::None => {}
            BandSelection::All => selected.extend(source.bands().iter().map(|b| b.name.as_str())),
            BandSelection::Only(names) => {
                for name in names {
                    if !source.contains_band(name) {
                        return Err(SnowError::Definition(format!(
                            "selected band '{}' not present in '{}'",
                            name, source.name
                        )));
                    }
                    selected.push(name);
                }
            }
        }

        let mut seen = std::collections::BTreeSet::new();
        for name in selected {
            if !seen.insert(name) {
                continue;
            }
            let Some(band) = source.band(name) else {
                continue;
            };
            if self.target.contains_band(name) {
                if !policy.overrides.iter().any(|o| o == name) {
                    return Err(SnowError::Definition(format!(
                        "band '{}' from '{}' collides with a band already in '{}'",
                        name, source.name, self.target.name
                    )));
                }
                log::debug!("Band '{}' from '{}' overrides merged band", name, source.name);
                self.target.replace_band(band.clone())?;
            } else {
                log::debug!("Copying band '{}' from '{}'", name, source.name);
                self.target.add_band(band.clone())?;
            }
        }

        if policy.masks {
            for mask in source.masks() {
                self.target.add_mask(mask.clone())?;
            }
        }

        if policy.tie_point_grids {
            for grid in source.tie_point_grids() {
                match self.target.tie_point_grid(&grid.name) {
                    Some(existing) if existing == grid => {}
                    Some(_) => {
                        return Err(SnowError::Definition(format!(
                            "tie-point grid '{}' from '{}' conflicts with '{}'",
                            grid.name, source.name, self.target.name
                        )));
                    }
                    None => {
                        log::debug!("Copying tie-point grid '{}' from '{}'", grid.name, source.name);
                        self.target.add_tie_point_grid(grid.clone())?;
                    }
                }
            }
        }

        Ok(())
    }
}
