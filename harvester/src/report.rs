use itertools::Itertools;
use squall_run_model::ScenarioKind;
use tabled::settings::Style;
use tabled::{Table, Tabled};

use crate::assemble::{IterationReport, IterationState};
use crate::flatten::FeatureRow;

#[derive(Tabled)]
struct ScenarioRow {
    scenario: &'static str,
    runs: usize,
    accumulated: usize,
    degraded: usize,
    excluded: usize,
    discarded: usize,
}

#[derive(Tabled)]
struct LabelRow {
    label: String,
    rows: usize,
    #[tabled(display = "float2")]
    share_pct: f64,
}

fn float2(n: &f64) -> String {
    format!("{:.2}", n)
}

/// Print the per-scenario outcome summary for a finished assembly.
pub fn print_iteration_summary(reports: &[IterationReport]) {
    if reports.is_empty() {
        return;
    }

    let mut lines = Vec::new();
    for (scenario, group) in &reports
        .iter()
        .sorted_by_key(|report| report.scenario)
        .chunk_by(|report| report.scenario)
    {
        let group: Vec<_> = group.collect();
        lines.push(ScenarioRow {
            scenario: scenario.label(),
            runs: group.len(),
            accumulated: count_state(&group, IterationState::Accumulated),
            degraded: group.iter().filter(|report| report.degraded).count(),
            excluded: count_state(&group, IterationState::Labeled),
            discarded: count_state(&group, IterationState::Discarded),
        });
    }

    let mut table = Table::new(lines);
    table.with(Style::modern());

    println!("{table}");
}

fn count_state(reports: &[&IterationReport], state: IterationState) -> usize {
    reports.iter().filter(|report| report.state == state).count()
}

/// Print the label distribution of a set of rows, the way it matters for training: per label
/// counts and their share of the whole.
pub fn print_label_distribution(rows: &[FeatureRow]) {
    if rows.is_empty() {
        return;
    }

    let counts = rows.iter().map(|row| row.label.as_str()).counts();
    let total = rows.len();

    // Known labels first, in their fixed order, then anything else alphabetically.
    let known: Vec<&str> = ScenarioKind::ALL.iter().map(|kind| kind.label()).collect();
    let lines: Vec<LabelRow> = counts
        .into_iter()
        .sorted_by_key(|(label, _)| {
            (
                known.iter().position(|k| k == label).unwrap_or(known.len()),
                label.to_string(),
            )
        })
        .map(|(label, count)| LabelRow {
            label: label.to_string(),
            rows: count,
            share_pct: 100.0 * count as f64 / total as f64,
        })
        .collect();

    let mut table = Table::new(lines);
    table.with(Style::modern());

    println!("{table}");
}
