use std::time::{Duration, Instant};

use serde::Serialize;

/// Execution metrics for a task that actually ran.
#[derive(Debug, Clone, Copy)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    /// The task ran and returned an error.
    Failed,
    /// Never started because something it depends on failed.
    DependencyFailed,
    /// Never started because the run was aborted.
    Cancelled,
    /// Never pulled into the run.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct TaskDiagnostics {
    pub name: String,
    pub outcome: TaskOutcome,
    /// Present only for tasks that executed.
    pub execution: Option<TaskExecution>,
}

/// Diagnostics and performance metrics for one execution.
///
/// Returned by [`Workload::execute`](crate::Workload::execute) after a run
/// in which every task succeeded.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub(crate) tasks: Vec<TaskDiagnostics>,
    /// Graph edges as task indices with an arrow style per relationship.
    pub(crate) edges: Vec<(usize, usize, &'static str)>,
}

/// Serializable run report, see [`Diagnostics::report`].
#[derive(Debug, Serialize)]
pub struct Report {
    pub tasks: Vec<ReportEntry>,
}

#[derive(Debug, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub outcome: TaskOutcome,
    /// Start offset from the beginning of the run, absent when not executed.
    pub offset_us: Option<u128>,
    pub duration_us: Option<u128>,
}

impl Diagnostics {
    pub fn tasks(&self) -> &[TaskDiagnostics] {
        &self.tasks
    }

    /// Renders the executed graph as a Mermaid diagram.
    ///
    /// Executed tasks are colored on a green-to-red ramp by duration,
    /// everything that did not run gets a fixed color by outcome.
    pub fn render_mermaid(&self) -> String {
        use std::fmt::Write;

        let mut f = String::new();
        writeln!(f, "graph LR").unwrap();

        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;
        for task in &self.tasks {
            if let Some(execution) = &task.execution {
                let secs = execution.duration.as_secs_f64();
                min_time = min_time.min(secs);
                max_time = max_time.max(secs);
            }
        }
        if min_time > max_time {
            // Nothing executed
            min_time = 0.0;
            max_time = 0.0;
        }
        // Avoid divide by zero if all tasks took the same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        for (index, task) in self.tasks.iter().enumerate() {
            let name = task.name.replace('"', "\\\"");
            let (label, color) = match (&task.execution, task.outcome) {
                (Some(execution), outcome) => {
                    let label = format!("{:.2?}", execution.duration);
                    let color = if outcome == TaskOutcome::Failed {
                        "#FF6961".to_string()
                    } else {
                        duration_color(execution.duration.as_secs_f64(), min_time, max_time)
                    };
                    (label, color)
                }
                (None, TaskOutcome::DependencyFailed) => {
                    ("Dependency failed".to_string(), "#FFB347".to_string())
                }
                (None, TaskOutcome::Cancelled) => {
                    ("Cancelled".to_string(), "#D3D3D3".to_string())
                }
                _ => ("Skipped".to_string(), "#ADD8E6".to_string()),
            };
            writeln!(f, "    {index}[\"{name}\\n{label}\"]").unwrap();
            writeln!(f, "    style {index} fill:{color}").unwrap();
        }

        for &(source, target, arrow) in &self.edges {
            writeln!(f, "    {source} {arrow} {target}").unwrap();
        }

        f
    }

    /// Build a serializable report with offsets relative to the earliest
    /// task start.
    pub fn report(&self) -> Report {
        let origin = self
            .tasks
            .iter()
            .filter_map(|task| task.execution.as_ref())
            .map(|execution| execution.start)
            .min();

        let tasks = self
            .tasks
            .iter()
            .map(|task| ReportEntry {
                name: task.name.clone(),
                outcome: task.outcome,
                offset_us: task.execution.as_ref().zip(origin).map(|(execution, origin)| {
                    execution.start.duration_since(origin).as_micros()
                }),
                duration_us: task
                    .execution
                    .as_ref()
                    .map(|execution| execution.duration.as_micros()),
            })
            .collect();

        Report { tasks }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.report())
    }
}

fn duration_color(value: f64, min: f64, max: f64) -> String {
    // Green through yellow to red as duration grows.
    let t = (value - min) / (max - min);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{r:02X}{g:02X}00")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executed(name: &str, offset: Duration, duration: Duration, origin: Instant) -> TaskDiagnostics {
        TaskDiagnostics {
            name: name.to_string(),
            outcome: TaskOutcome::Success,
            execution: Some(TaskExecution {
                start: origin + offset,
                duration,
            }),
        }
    }

    #[test]
    fn mermaid_marks_outcomes() {
        let origin = Instant::now();
        let diagnostics = Diagnostics {
            tasks: vec![
                executed("fast", Duration::ZERO, Duration::from_millis(1), origin),
                executed("slow", Duration::from_millis(1), Duration::from_secs(2), origin),
                TaskDiagnostics {
                    name: "blocked".to_string(),
                    outcome: TaskOutcome::DependencyFailed,
                    execution: None,
                },
            ],
            edges: vec![(0, 2, "-->")],
        };

        let rendered = diagnostics.render_mermaid();
        assert!(rendered.contains("graph LR"));
        assert!(rendered.contains("Dependency failed"));
        assert!(rendered.contains("0 --> 2"));
    }

    #[test]
    fn report_offsets_are_relative_to_first_start() {
        let origin = Instant::now();
        let diagnostics = Diagnostics {
            tasks: vec![
                executed("first", Duration::ZERO, Duration::from_millis(5), origin),
                executed("second", Duration::from_millis(10), Duration::from_millis(5), origin),
            ],
            edges: Vec::new(),
        };

        let report = diagnostics.report();
        assert_eq!(report.tasks[0].offset_us, Some(0));
        assert_eq!(report.tasks[1].offset_us, Some(10_000));
    }

    #[test]
    fn report_serializes_to_json() {
        let diagnostics = Diagnostics {
            tasks: vec![TaskDiagnostics {
                name: "lonely".to_string(),
                outcome: TaskOutcome::Skipped,
                execution: None,
            }],
            edges: Vec::new(),
        };

        let json = diagnostics.to_json().unwrap();
        assert!(json.contains("\"skipped\""));
        assert!(json.contains("\"lonely\""));
    }
}
