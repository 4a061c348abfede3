/*
 * Copyright (C) 2024 The Direct CSI Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod args;
pub mod commands;

use glob::Pattern;

/// Matches a value against a glob list. An empty list or a `*` entry
/// matches anything.
pub fn matches_glob_filters(filters: &[String], value: &str) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|filter| {
        filter == "*"
            || Pattern::new(filter)
                .map(|pattern| pattern.matches(value))
                .unwrap_or(false)
    })
}

/// Pads rows into aligned columns for terminal output.
pub fn render_table(header: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            if index < widths.len() {
                widths[index] = widths[index].max(cell.len());
            }
        }
    }

    let mut out = String::new();
    let render_row = |cells: Vec<String>, widths: &[usize]| -> String {
        let mut line = String::new();
        for (index, cell) in cells.iter().enumerate() {
            line.push_str(cell);
            if index + 1 < cells.len() {
                line.push_str(&" ".repeat(widths[index].saturating_sub(cell.len()) + 2));
            }
        }
        line.push('\n');
        line
    };

    out.push_str(&render_row(
        header.iter().map(|h| h.to_string()).collect(),
        &widths,
    ));
    for row in rows {
        out.push_str(&render_row(row.clone(), &widths));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_list_matches_everything() {
        assert!(matches_glob_filters(&[], "node-1"));
    }

    #[test]
    fn star_and_globs_match() {
        let filters = vec!["node-*".to_string()];
        assert!(matches_glob_filters(&filters, "node-7"));
        assert!(!matches_glob_filters(&filters, "worker-7"));
        assert!(matches_glob_filters(&["*".to_string()], "anything"));
    }

    #[test]
    fn table_columns_align() {
        let rows = vec![
            vec!["abc".to_string(), "Ready".to_string()],
            vec!["a".to_string(), "InUse".to_string()],
        ];
        let table = render_table(&["DRIVE", "STATUS"], &rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        let status_column = lines[0].find("STATUS").expect("header column");
        assert_eq!(lines[1].find("Ready"), Some(status_column));
        assert_eq!(lines[2].find("InUse"), Some(status_column));
    }
}
