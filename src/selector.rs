//! Chapter filtering and version selection.
//!
//! Turns a [ChapterCatalog] plus user preferences into the ordered list of chapters to fetch,
//! each paired with exactly one chosen [ChapterVersion].

use crate::catalog::ChapterCatalog;
use crate::model::{ChapterNumber, ChapterVersion};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A chapter filter token could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid chapter filter token '{token}'. Use numbers, ranges like 1-5, or 'all', separated by commas.")]
pub struct FilterSyntaxError {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq)]
enum FilterToken {
    All,
    Single(f64),
    Range(f64, f64),
}

/// Parsed `--chapters` expression: union of single numbers, inclusive ranges, and `all`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterFilter {
    tokens: Vec<FilterToken>,
}

impl ChapterFilter {
    pub fn all() -> Self {
        Self {
            tokens: vec![FilterToken::All],
        }
    }

    /// Parse a comma-separated filter expression, e.g. `1-3,5,10.5` or `all`.
    pub fn parse(expr: &str) -> Result<Self, FilterSyntaxError> {
        let mut tokens = Vec::new();
        for raw in expr.split(',') {
            let token = raw.trim();
            let err = || FilterSyntaxError {
                token: token.to_string(),
            };
            if token.is_empty() {
                return Err(err());
            }
            if token.eq_ignore_ascii_case("all") {
                tokens.push(FilterToken::All);
                continue;
            }
            match token.split_once('-') {
                Some((from, to)) => {
                    let from = parse_bound(from).ok_or_else(err)?;
                    let to = parse_bound(to).ok_or_else(err)?;
                    if from > to {
                        return Err(err());
                    }
                    tokens.push(FilterToken::Range(from, to));
                }
                None => tokens.push(FilterToken::Single(parse_bound(token).ok_or_else(err)?)),
            }
        }
        Ok(Self { tokens })
    }

    pub fn matches(&self, number: &ChapterNumber) -> bool {
        let v = number.value();
        self.tokens.iter().any(|t| match *t {
            FilterToken::All => true,
            FilterToken::Single(n) => v == n,
            FilterToken::Range(from, to) => v >= from && v <= to,
        })
    }
}

fn parse_bound(s: &str) -> Option<f64> {
    ChapterNumber::parse(s).map(|n| n.value())
}

/// Split each `--group` value on commas, trim, drop empties. Order is kept.
pub fn normalize_groups<S: AsRef<str>>(values: &[S]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.as_ref().split(','))
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(String::from)
        .collect()
}

/// User preferences that drive selection.
#[derive(Debug, Clone)]
pub struct SelectionCriteria {
    pub filter: ChapterFilter,
    pub no_partials: bool,
    pub preferred_groups: Vec<String>,
    pub mix_by_upvote: bool,
}

/// Why a version was picked. Logged and kept for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickReason {
    /// No preferred groups: highest upvotes overall.
    Upvotes,
    /// Highest upvotes among versions from any preferred group.
    MixedByUpvote,
    /// First preferred group (in the user's order) that has a version.
    GroupPriority,
    /// Preferred groups given but none had a version.
    Fallback,
}

/// One chapter with its chosen version.
#[derive(Debug, Clone, PartialEq)]
pub struct Pick {
    pub chapter: ChapterNumber,
    pub version: ChapterVersion,
    pub reason: PickReason,
}

/// Non-fatal selection outcome worth reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionDiagnostic {
    NoVersionAvailable { chapter: ChapterNumber },
}

#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Ascending by chapter number; at most one pick per chapter.
    pub picks: Vec<Pick>,
    pub diagnostics: Vec<SelectionDiagnostic>,
}

/// Apply filter, partial exclusion, and group preferences to the catalog.
pub fn select(catalog: &ChapterCatalog, criteria: &SelectionCriteria) -> Selection {
    let mut selection = Selection::default();
    for chapter in catalog.iter() {
        if !criteria.filter.matches(&chapter.number) {
            continue;
        }
        if criteria.no_partials && !chapter.number.is_integer() {
            debug!(chapter = %chapter.number, "skipping partial chapter");
            continue;
        }
        match choose_version(
            &chapter.versions,
            &criteria.preferred_groups,
            criteria.mix_by_upvote,
        ) {
            Some((version, reason)) => {
                if reason == PickReason::Fallback {
                    info!(
                        chapter = %chapter.number,
                        group = %version.group_label(),
                        "no preferred group has this chapter; using most upvoted"
                    );
                } else {
                    debug!(
                        chapter = %chapter.number,
                        group = %version.group_label(),
                        upvotes = version.upvotes,
                        ?reason,
                        "selected version"
                    );
                }
                selection.picks.push(Pick {
                    chapter: chapter.number.clone(),
                    version: version.clone(),
                    reason,
                });
            }
            None => {
                warn!(chapter = %chapter.number, "no version available");
                selection
                    .diagnostics
                    .push(SelectionDiagnostic::NoVersionAvailable {
                        chapter: chapter.number.clone(),
                    });
            }
        }
    }
    selection
}

/// Highest upvote count; ties go to the first in iteration order.
fn most_upvoted<'a, I>(versions: I) -> Option<&'a ChapterVersion>
where
    I: IntoIterator<Item = &'a ChapterVersion>,
{
    let mut best: Option<&ChapterVersion> = None;
    for v in versions {
        if best.map_or(true, |b| v.upvotes > b.upvotes) {
            best = Some(v);
        }
    }
    best
}

/// Pick one version of a chapter. `None` only when there are no versions at all.
pub fn choose_version<'a>(
    versions: &'a [ChapterVersion],
    preferred_groups: &[String],
    mix_by_upvote: bool,
) -> Option<(&'a ChapterVersion, PickReason)> {
    let overall = most_upvoted(versions)?;
    if preferred_groups.is_empty() {
        return Some((overall, PickReason::Upvotes));
    }
    if mix_by_upvote {
        let preferred = versions
            .iter()
            .filter(|v| preferred_groups.iter().any(|g| v.matches_group(g)));
        if let Some(best) = most_upvoted(preferred) {
            return Some((best, PickReason::MixedByUpvote));
        }
    } else {
        for group in preferred_groups {
            if let Some(best) = most_upvoted(versions.iter().filter(|v| v.matches_group(group))) {
                return Some((best, PickReason::GroupPriority));
            }
        }
    }
    Some((overall, PickReason::Fallback))
}
