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

use std::env;
use std::error::Error;
use std::fs;
use std::path::{Component, PathBuf};

const SERVICE_ACCOUNT_NAMESPACE_FILE: &str =
    "/var/run/secrets/kubernetes.io/serviceaccount/namespace";

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    Keyspace,
    LockFile,
    MountRoot,
    DevRoot,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Keyspace => "DIRECT_CSI_KEYSPACE",
            Config::LockFile => "DIRECT_CSI_LOCK_FILE",
            Config::MountRoot => "DIRECT_CSI_MOUNT_ROOT",
            Config::DevRoot => "DIRECT_CSI_DEV_ROOT",
        }
    }

    /// Returns the default value for the config parameter.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Keyspace => "/var/lib/direct-csi/keyspace",
            Config::LockFile => "/var/lib/direct-csi/keyspace/.lock",
            Config::MountRoot => "/var/lib/direct-csi/mnt",
            Config::DevRoot => "/var/lib/direct-csi/devices",
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Creates the directory for this parameter if needed and returns it.
    pub fn verify(&self) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let path = self.get_path();
        let dir = match self {
            Config::LockFile => path.parent().map(|p| p.to_path_buf()),
            _ => Some(path.clone()),
        };
        if let Some(dir) = dir {
            if !dir.exists() {
                fs::create_dir_all(&dir).map_err(|e| {
                    format!("Failed to create directory '{}': {}", dir.display(), e)
                })?;
            } else if !dir.is_dir() {
                return Err(
                    format!("Path '{}' exists but is not a directory", dir.display()).into(),
                );
            }
        }
        Ok(path)
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and
    /// returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

/// Resolves the namespace this process operates in: `POD_NAMESPACE`, the
/// mounted service-account token file, then `default`.
pub fn pod_namespace() -> String {
    if let Ok(ns) = env::var("POD_NAMESPACE") {
        if !ns.is_empty() {
            return ns;
        }
    }
    if let Ok(data) = fs::read_to_string(SERVICE_ACCOUNT_NAMESPACE_FILE) {
        let ns = data.trim();
        if !ns.is_empty() {
            return ns.to_string();
        }
    }
    "default".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::test_support::{keyspace_lock, EnvGuard};

    #[test]
    fn env_override_wins_over_default() {
        let _lock = keyspace_lock().lock().unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("DIRECT_CSI_MOUNT_ROOT", "/custom/mnt");
        assert_eq!(Config::MountRoot.get_path(), PathBuf::from("/custom/mnt"));
    }

    #[test]
    fn normalize_collapses_dot_segments() {
        let _lock = keyspace_lock().lock().unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("DIRECT_CSI_DEV_ROOT", "/a/b/../c/./d");
        assert_eq!(Config::DevRoot.get_path(), PathBuf::from("/a/c/d"));
    }

    #[test]
    fn pod_namespace_prefers_environment() {
        let _lock = keyspace_lock().lock().unwrap_or_else(|p| p.into_inner());
        let _guard = EnvGuard::set("POD_NAMESPACE", "storage");
        assert_eq!(pod_namespace(), "storage");
    }
}
