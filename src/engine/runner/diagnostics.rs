use std::fmt::Write;
use std::time::Duration;

use petgraph::graph::NodeIndex;

use crate::blueprint::TaskGraph;
use crate::engine::TaskState;

use super::RunReport;

impl RunReport {
    /// Renders the task graph as a Mermaid diagram, color-coded by the final
    /// state of each task.
    ///
    /// * **Green**: Done
    /// * **Blue**: Skipped
    /// * **Red**: Failed
    /// * **Grey**: Never reached
    pub fn render_mermaid(&self, graph: &TaskGraph) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (index, task) in graph.tasks() {
            let name = task.name().replace('"', "\\\"");
            let state = self.state(index);

            let label = match (state, self.execution_times.get(&index)) {
                (TaskState::Failed { exit_code }, _) => format!("exit {exit_code}"),
                (TaskState::Done, Some(exec)) => format!("{:.2?}", exec.duration),
                (state, _) => state.name().to_string(),
            };

            let color = match state {
                TaskState::Done => "#90EE90",
                TaskState::Skipped => "#ADD8E6",
                TaskState::Failed { .. } => "#F08080",
                TaskState::Running => "#FFFF99",
                TaskState::Pending => "#D3D3D3",
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for (source, target) in graph.edges() {
            let _ = writeln!(f, "    {} --> {}", source.index(), target.index());
        }

        f
    }

    /// The `n` tasks that ran the longest, slowest first.
    pub fn slowest(&self, n: usize) -> Vec<(NodeIndex, Duration)> {
        let mut times: Vec<_> = self
            .execution_times
            .iter()
            .map(|(index, exec)| (*index, exec.duration))
            .collect();

        times.sort_by(|a, b| b.1.cmp(&a.1));
        times.truncate(n);
        times
    }
}
