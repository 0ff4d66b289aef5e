//! Execution statistics table.

use chrono::DateTime;
use folio_core::ExecutionResult;

const HEADERS: [&str; 5] = ["Document", "Modified", "Method", "Run Time (s)", "Status"];

/// One executed document.
#[derive(Debug, Clone)]
pub struct StatsRow {
    pub document: String,
    pub result: ExecutionResult,
}

impl StatsRow {
    fn cells(&self) -> [String; 5] {
        let modified = DateTime::from_timestamp(self.result.mtime.trunc() as i64, 0)
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        let runtime = self
            .result
            .runtime
            .map(|r| format!("{r:.2}"))
            .unwrap_or_else(|| "-".to_string());
        let status = if self.result.succeeded { "✅" } else { "❌" };
        [
            self.document.clone(),
            modified,
            self.result.method.to_string(),
            runtime,
            status.to_string(),
        ]
    }
}

/// Render rows as a Markdown table.
pub fn render_table(rows: &[StatsRow]) -> String {
    let body: Vec<[String; 5]> = rows.iter().map(StatsRow::cells).collect();
    let mut widths = HEADERS.map(|h| h.chars().count());
    for cells in &body {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let line = |cells: &[String]| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, &width)| format!("{cell:<width$}"))
            .collect();
        format!("| {} |", padded.join(" | "))
    };

    let mut out = Vec::with_capacity(body.len() + 2);
    out.push(line(&HEADERS.map(str::to_string)));
    let rule: Vec<String> = widths.iter().map(|&w| "-".repeat(w)).collect();
    out.push(format!("|-{}-|", rule.join("-|-")));
    out.extend(body.iter().map(|cells| line(cells)));
    out.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::ExecutionMode;

    #[test]
    fn test_render_table() {
        let rows = vec![
            StatsRow {
                document: "intro.ipynb".to_string(),
                result: ExecutionResult::success_at(ExecutionMode::Cache, Some(1.5), 0.0),
            },
            StatsRow {
                document: "broken.ipynb".to_string(),
                result: ExecutionResult {
                    mtime: 86_400.0,
                    runtime: None,
                    method: ExecutionMode::Force,
                    succeeded: false,
                    error: Some("ZeroDivisionError".to_string()),
                    traceback: Some("tb".to_string()),
                },
            },
        ];

        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("| Document "));
        assert!(lines[2].contains("1970-01-01 00:00"));
        assert!(lines[2].contains("| cache "));
        assert!(lines[2].contains("1.50"));
        assert!(lines[3].contains("1970-01-02 00:00"));
        assert!(lines[3].contains("❌"));
    }
}
