use crate::table::{PublishedRow, PublishedTable, RowKey};
use crate::types::{AdminLevel, Attributes, BoundaryRow};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// A boundary row ready for publication: geometry stripped, count settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalRow {
    pub country_code: String,
    pub admin_level: AdminLevel,
    pub place_code: String,
    pub health_facility_count: u64,
    pub attributes: Attributes,
}

/// Everything one level contributes to the published table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalRows {
    pub level: AdminLevel,
    pub updated_countries: BTreeSet<String>,
    pub rows: Vec<FinalRow>,
}

/// Settles one level's boundary rows for publication.
///
/// Rows of countries outside `updated_countries` are dropped: they were not
/// attempted this run and must not overwrite what is already published. Kept
/// rows that received no facility are counted as zero.
pub fn finalize_level(
    level: AdminLevel,
    boundary_rows: &[BoundaryRow],
    updated_countries: &BTreeSet<String>,
) -> FinalRows {
    let rows: Vec<FinalRow> = boundary_rows
        .iter()
        .filter(|row| row.admin_level == level && updated_countries.contains(&row.country_code))
        .map(|row| FinalRow {
            country_code: row.country_code.clone(),
            admin_level: row.admin_level,
            place_code: row.place_code.clone(),
            health_facility_count: row.health_facility_count.unwrap_or(0),
            attributes: row.attributes.clone(),
        })
        .collect();

    debug!(
        "adm{}: finalized {} rows for {} countries",
        level,
        rows.len(),
        updated_countries.len()
    );

    FinalRows {
        level,
        updated_countries: updated_countries.clone(),
        rows,
    }
}

/// Replaces the published rows of every updated (country, level) pair with
/// the freshly finalized rows, then sorts by country, level and place code.
/// Rows of pairs not updated this run are carried over untouched.
pub fn merge_into_published(
    mut published: PublishedTable,
    finalized: &[FinalRows],
) -> PublishedTable {
    let columns = published.columns().clone();

    // Settle the header before building any row so every row has the same width
    if published.headers.is_empty() {
        for name in [
            &columns.country_code,
            &columns.admin_level,
            &columns.place_code,
            &columns.health_facilities,
        ] {
            published.ensure_column(name);
        }
    }
    let mut extra_columns: BTreeSet<&String> = BTreeSet::new();
    for level in finalized {
        for row in &level.rows {
            extra_columns.extend(row.attributes.keys());
        }
    }
    for name in extra_columns {
        published.ensure_column(name);
    }
    let count_idx = published.ensure_column(&columns.health_facilities);
    let country_idx = published.ensure_column(&columns.country_code);
    let level_idx = published.ensure_column(&columns.admin_level);
    let place_idx = published.ensure_column(&columns.place_code);

    for level in finalized {
        if level.rows.is_empty() {
            continue;
        }

        let before = published.rows.len();
        published.rows.retain(|row| {
            !(row.key.admin_level == level.level
                && level.updated_countries.contains(&row.key.country_code))
        });
        info!(
            "adm{}: replacing {} published rows with {} fresh rows",
            level.level,
            before - published.rows.len(),
            level.rows.len()
        );

        for row in &level.rows {
            let mut fields: Vec<String> = published
                .headers
                .iter()
                .map(|h| row.attributes.get(h).cloned().unwrap_or_default())
                .collect();
            fields[country_idx] = row.country_code.clone();
            fields[level_idx] = row.admin_level.to_string();
            fields[place_idx] = row.place_code.clone();
            fields[count_idx] = row.health_facility_count.to_string();

            published.rows.push(PublishedRow {
                key: RowKey {
                    country_code: row.country_code.clone(),
                    admin_level: row.admin_level,
                    place_code: row.place_code.clone(),
                },
                fields,
            });
        }
    }

    published.rows.sort_by(|a, b| a.key.cmp(&b.key));
    published
}
