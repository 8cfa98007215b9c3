//! Deterministic narrative used when the language model is disabled or down.

use crate::{Narrative, NarrativeSource, TreeMetrics};

pub const HEADER: &str = "Based on the detected tree coverage, here are some recommendations:";

/// Number of guidance lines in every rule-based narrative
pub const GUIDANCE_LINES: usize = 3;

/// Tree counts below this add the density line
pub const LOW_DENSITY_TREE_COUNT: u64 = 10;

const LOW_COVERAGE: [&str; 3] = [
    "Tree coverage is low. Prioritize planting street trees along sidewalks and medians.",
    "Convert underused paved surfaces into planted green space to reduce urban heat.",
    "Organize a community tree-planting program with local groups and the city forester.",
];

const MODERATE_COVERAGE: [&str; 3] = [
    "Tree coverage is moderate. Fill gaps in the canopy with new plantings.",
    "Protect existing mature trees during construction and redevelopment.",
    "Aim for at least 40% coverage to maximize shade and cooling.",
];

const HEALTHY_COVERAGE: [&str; 3] = [
    "Tree coverage is healthy. Focus on maintaining and protecting the existing canopy.",
    "Schedule regular pruning and health inspections for mature trees.",
    "Diversify species when replacing trees to keep the canopy resilient.",
];

const LOW_DENSITY: &str =
    "Few individual trees were detected. Add trees to increase canopy density.";

fn tier(tree_cover_percent: f64) -> &'static [&'static str; 3] {
    if tree_cover_percent < 20.0 {
        &LOW_COVERAGE
    } else if tree_cover_percent < 40.0 {
        &MODERATE_COVERAGE
    } else {
        &HEALTHY_COVERAGE
    }
}

/// Guidance lines for a result, in output order.
///
/// The density line is appended after the tier lines and the list is then cut
/// to [`GUIDANCE_LINES`], keeping the density line in the last slot.
pub fn guidance_lines(metrics: &TreeMetrics) -> Vec<&'static str> {
    let mut lines: Vec<&'static str> = tier(metrics.tree_cover_percent).to_vec();

    if metrics.tree_count < LOW_DENSITY_TREE_COUNT {
        lines.truncate(GUIDANCE_LINES - 1);
        lines.push(LOW_DENSITY);
    }

    lines.truncate(GUIDANCE_LINES);
    lines
}

/// Header plus three guidance lines. Total and deterministic.
pub fn rule_based_narrative(metrics: &TreeMetrics) -> Narrative {
    let mut text = String::from(HEADER);
    for line in guidance_lines(metrics) {
        text.push_str("\n- ");
        text.push_str(line);
    }

    Narrative {
        text,
        source: NarrativeSource::RuleBased,
    }
}
