//! # Geographic hierarchy index
//!
//! Parses fixed-width area codes into a four-level nesting
//! (region / subregion / district / area) and exposes the index arrays the
//! hierarchical intercepts are keyed by. Codes are split into per-level
//! segments; each segment must map to exactly one parent segment across the
//! whole table, otherwise construction fails.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors returned while building the hierarchy index.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HierarchyError {
    #[error("at least one geographic code is required")]
    EmptyCodes,
    #[error("hierarchy layout widths must all be positive")]
    InvalidLayout,
    #[error("code at row {index} has length {found}, layout expects {expected}")]
    BadCodeWidth {
        index: usize,
        expected: usize,
        found: usize,
    },
    #[error("code at row {index} contains non-ASCII characters")]
    NonAsciiCode { index: usize },
    #[error(
        "segment '{code}' at the {level} level has conflicting parents '{parent_a}' and '{parent_b}'"
    )]
    InconsistentParent {
        level: &'static str,
        code: String,
        parent_a: String,
        parent_b: String,
    },
}

/// Fixed per-level segment widths of a geographic code.
///
/// A code is the concatenation of one segment per level, so its total length
/// must equal the sum of the widths. The default layout is one region digit,
/// two subregion digits, three district digits, and five area digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HierarchyLayout {
    pub widths: [usize; 4],
}

impl Default for HierarchyLayout {
    fn default() -> Self {
        Self {
            widths: [1, 2, 3, 5],
        }
    }
}

impl HierarchyLayout {
    /// Total code length implied by the layout.
    #[must_use]
    pub fn total_width(&self) -> usize {
        self.widths.iter().sum()
    }

    fn segment(&self, level: usize) -> (usize, usize) {
        let start = self.widths.iter().take(level).sum::<usize>();
        (start, start + self.widths[level])
    }
}

/// Deduplicated, stable-sorted hierarchy levels plus the leaf-to-level and
/// child-to-parent index arrays. All indices are 0-based; construction is
/// deterministic for identical input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyIndex {
    /// Sorted unique region segments.
    pub regions: Vec<String>,
    /// Sorted unique subregion segments.
    pub subregions: Vec<String>,
    /// Sorted unique district segments.
    pub districts: Vec<String>,
    /// Region index per input row.
    pub region_of: Vec<usize>,
    /// Subregion index per input row.
    pub subregion_of: Vec<usize>,
    /// District index per input row.
    pub district_of: Vec<usize>,
    /// Parent subregion index per district.
    pub district_parent: Vec<usize>,
    /// Parent region index per subregion.
    pub subregion_parent: Vec<usize>,
}

impl HierarchyIndex {
    /// Parse `codes` against `layout` and build the full index.
    ///
    /// # Errors
    ///
    /// Returns `HierarchyError` for malformed codes or when a child segment
    /// appears under two different parents.
    pub fn build(codes: &[String], layout: HierarchyLayout) -> Result<Self, HierarchyError> {
        if codes.is_empty() {
            return Err(HierarchyError::EmptyCodes);
        }
        if layout.widths.contains(&0) {
            return Err(HierarchyError::InvalidLayout);
        }
        let expected = layout.total_width();
        for (index, code) in codes.iter().enumerate() {
            if !code.is_ascii() {
                return Err(HierarchyError::NonAsciiCode { index });
            }
            if code.len() != expected {
                return Err(HierarchyError::BadCodeWidth {
                    index,
                    expected,
                    found: code.len(),
                });
            }
        }

        // BTreeMap keeps each level deduplicated and stable-sorted; the map
        // value records the unique parent segment seen so far.
        let mut regions = BTreeMap::new();
        let mut subregions = BTreeMap::new();
        let mut districts = BTreeMap::new();
        for code in codes {
            let region = segment_str(code, layout, 0);
            let subregion = segment_str(code, layout, 1);
            let district = segment_str(code, layout, 2);
            regions.entry(region.to_string()).or_insert(());
            record_parent(&mut subregions, "subregion", subregion, region)?;
            record_parent(&mut districts, "district", district, subregion)?;
        }

        let region_index = index_of(regions.keys());
        let subregion_index = index_of(subregions.keys());
        let district_index = index_of(districts.keys());

        let subregion_parent = subregions
            .values()
            .map(|parent| region_index[parent.as_str()])
            .collect();
        let district_parent = districts
            .values()
            .map(|parent| subregion_index[parent.as_str()])
            .collect();

        let mut region_of = Vec::with_capacity(codes.len());
        let mut subregion_of = Vec::with_capacity(codes.len());
        let mut district_of = Vec::with_capacity(codes.len());
        for code in codes {
            region_of.push(region_index[segment_str(code, layout, 0)]);
            subregion_of.push(subregion_index[segment_str(code, layout, 1)]);
            district_of.push(district_index[segment_str(code, layout, 2)]);
        }

        Ok(Self {
            regions: regions.into_keys().collect(),
            subregions: subregions.into_keys().collect(),
            districts: districts.into_keys().collect(),
            region_of,
            subregion_of,
            district_of,
            district_parent,
            subregion_parent,
        })
    }

    /// Number of input rows (leaf areas).
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.district_of.len()
    }

    #[must_use]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn subregion_count(&self) -> usize {
        self.subregions.len()
    }

    #[must_use]
    pub fn district_count(&self) -> usize {
        self.districts.len()
    }
}

fn segment_str(code: &str, layout: HierarchyLayout, level: usize) -> &str {
    let (start, end) = layout.segment(level);
    &code[start..end]
}

fn record_parent(
    map: &mut BTreeMap<String, String>,
    level: &'static str,
    child: &str,
    parent: &str,
) -> Result<(), HierarchyError> {
    if let Some(existing) = map.get(child) {
        if existing != parent {
            return Err(HierarchyError::InconsistentParent {
                level,
                code: child.to_string(),
                parent_a: existing.clone(),
                parent_b: parent.to_string(),
            });
        }
    } else {
        map.insert(child.to_string(), parent.to_string());
    }
    Ok(())
}

fn index_of<'a, I: Iterator<Item = &'a String>>(keys: I) -> BTreeMap<&'a str, usize> {
    keys.enumerate()
        .map(|(index, key)| (key.as_str(), index))
        .collect()
}
