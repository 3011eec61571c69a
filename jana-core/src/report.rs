use std::time::Duration;

use crate::topology::Topology;

/// `val` rendered with the Latin unit prefix the original's
/// `JApplication::Val2StringWithPrefix` picks: `G`/`M`/`k` above
/// 1.5e9/1.5e6/1.5e3, `u`/`m` below 1.0e-4/1.0e-1 (but never below
/// 1.0e-7, where no prefix fits and the raw value is shown), none
/// otherwise. Used for both the integrated and instantaneous event rates.
pub fn format_rate(val: f64) -> String {
    let (scaled, unit) = if val > 1.5e9 {
        (val / 1.0e9, "G")
    } else if val > 1.5e6 {
        (val / 1.0e6, "M")
    } else if val > 1.5e3 {
        (val / 1.0e3, "k")
    } else if val < 1.0e-7 {
        (val, "")
    } else if val < 1.0e-4 {
        (val / 1.0e6, "u")
    } else if val < 1.0e-1 {
        (val / 1.0e3, "m")
    } else {
        (val, "")
    };
    format!("{scaled:.1} {unit}")
}

/// One row of the final report's source/queue table: a pipeline's
/// source arrow and the chain of downstream arrows it feeds.
pub struct PipelineReport {
    pub source_name: String,
    pub events_processed: u64,
    pub still_active: bool,
    pub arrows: Vec<ArrowReport>,
}

pub struct ArrowReport {
    pub name: String,
    pub tasks_processed: u64,
}

/// Aggregated run statistics, printed after the worker pool joins
/// (spec.md §6 "Final report", grounded in
/// `JApplication::PrintFinalReport`).
pub struct FinalReport {
    pub pipelines: Vec<PipelineReport>,
    pub total_events: u64,
    pub elapsed: Duration,
}

impl FinalReport {
    /// Build a report from a topology's current arrow metrics. Root
    /// arrows (those with an empty `depends_on` entry) are treated as
    /// pipeline sources, matching how `TopologyBuilder` always pushes a
    /// `SourceArrow` first with no recorded dependencies.
    pub fn collect(topology: &Topology, elapsed: Duration) -> Self {
        let arrows = topology.arrows();
        let depends_on = topology.depends_on_table();

        let mut pipelines = Vec::new();
        let mut total_events = 0u64;

        for (index, arrow) in arrows.iter().enumerate() {
            if !depends_on[index].is_empty() {
                continue;
            }
            let events_processed = arrow.metrics().successful_calls();
            total_events += events_processed;

            let mut downstream = Vec::new();
            let mut frontier = vec![index];
            let mut visited = vec![false; arrows.len()];
            visited[index] = true;
            while let Some(current) = frontier.pop() {
                for (candidate, deps) in depends_on.iter().enumerate() {
                    if !visited[candidate] && deps.contains(&current) {
                        visited[candidate] = true;
                        downstream.push(candidate);
                        frontier.push(candidate);
                    }
                }
            }
            downstream.sort_unstable();

            let mut arrow_reports: Vec<ArrowReport> = downstream
                .into_iter()
                .map(|i| ArrowReport {
                    name: arrows[i].name().to_string(),
                    tasks_processed: arrows[i].metrics().successful_calls(),
                })
                .collect();
            arrow_reports.insert(
                0,
                ArrowReport {
                    name: arrow.name().to_string(),
                    tasks_processed: events_processed,
                },
            );

            pipelines.push(PipelineReport {
                source_name: arrow.name().to_string(),
                events_processed,
                still_active: !arrow.is_finished(),
                arrows: arrow_reports,
            });
        }

        Self {
            pipelines,
            total_events,
            elapsed,
        }
    }

    pub fn integrated_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            0.0
        } else {
            self.total_events as f64 / secs
        }
    }

    /// Render the report the way `PrintFinalReport` does: a source/queue
    /// table with dynamically sized columns, an asterisk on sources
    /// still active at print time, then total events and integrated
    /// rate.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push('\n');
        out.push_str("Final Report\n");

        let source_width = self
            .pipelines
            .iter()
            .map(|p| p.source_name.len() + 1)
            .max()
            .unwrap_or(0)
            .max(8);
        let queue_width = self
            .pipelines
            .iter()
            .flat_map(|p| p.arrows.iter())
            .map(|a| a.name.len())
            .max()
            .unwrap_or(0)
            .max(7);

        let rule_width = source_width + 12 + queue_width + 9;
        let rule = "-".repeat(rule_width);
        out.push_str(&rule);
        out.push('\n');
        out.push_str(&format!(
            "{:<source_width$}   Nevents  {:<queue_width$}NTasks\n",
            "Source", "Queue"
        ));
        out.push_str(&rule);
        out.push('\n');

        let mut any_active = false;
        for pipeline in &self.pipelines {
            let flag = if pipeline.still_active { "*" } else { "" };
            any_active |= pipeline.still_active;
            let label = format!("{}{flag}", pipeline.source_name);
            out.push_str(&format!(
                "{:<source_width$}{:>10}  ",
                label, pipeline.events_processed
            ));
            for (i, arrow) in pipeline.arrows.iter().enumerate() {
                if i > 0 {
                    out.push_str(&" ".repeat(source_width + 12));
                }
                out.push_str(&format!(
                    "{:<queue_width$}{}\n",
                    arrow.name, arrow.tasks_processed
                ));
            }
        }

        if any_active {
            out.push('\n');
            out.push_str("(*) indicates sources that were still active\n");
        }

        out.push('\n');
        out.push_str(&format!(
            "Total events processed: {} (~ {}evt)\n",
            self.total_events,
            format_rate(self.total_events as f64)
        ));
        out.push_str(&format!(
            "Integrated Rate: {}Hz\n",
            format_rate(self.integrated_rate())
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_prefix_thresholds() {
        // Mirrors `JApplication::Val2StringWithPrefix` literally, including
        // its division (not multiplication) in the `u`/`m` branches — that
        // divides already-tiny values further towards zero, which reads as
        // backwards for a unit prefix, but is exactly the original's math.
        assert_eq!(format_rate(2_000_000_000.0), "2.0 G");
        assert_eq!(format_rate(3_000_000.0), "3.0 M");
        assert_eq!(format_rate(2_000.0), "2.0 k");
        assert_eq!(format_rate(500.0), "500.0 ");
        assert_eq!(format_rate(0.05), "0.0 m");
        assert_eq!(format_rate(0.00005), "0.0 u");
        assert_eq!(format_rate(0.0000000001), "0.0 ");
    }
}
