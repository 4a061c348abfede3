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

pub mod error;
pub mod keyspace;

pub use keyspace::{Keyspace, KeyspaceEvent, KeyspaceEventType, KeyspaceWatchStream};

/// Reduces an arbitrary identifier to a DNS-1123 compatible name.
///
/// Used for lease and lock names derived from hostnames and user input.
pub fn sanitize_name(input: &str) -> String {
    let mut name: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    while name.contains("--") {
        name = name.replace("--", "-");
    }
    let trimmed = name.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_flattens_invalid_characters() {
        assert_eq!(sanitize_name("Node_01.local"), "node-01-local");
        assert_eq!(sanitize_name("--weird--"), "weird");
        assert_eq!(sanitize_name("???"), "x");
    }
}
