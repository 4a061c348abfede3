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

use crate::directcsi::client::ObjectStore;
use crate::directcsi::logger::log_info;
use crate::directcsi::Config;

use std::error::Error;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "install";

/// Prepares the host for the driver: data directories plus the stored
/// object-version record.
pub fn install(store: &ObjectStore) -> Result<(), DynError> {
    for config in [
        Config::Keyspace,
        Config::LockFile,
        Config::MountRoot,
        Config::DevRoot,
    ] {
        let path = config.verify()?;
        log_info(
            COMPONENT,
            "Prepared directory",
            &[("path", &path.display().to_string())],
        );
    }

    store.migrate_stored_objects()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directcsi::test_support::{EnvGuard, TestEnv};

    #[test]
    fn install_creates_directories_and_version_record() {
        let env = TestEnv::new();
        let mount_root = env.root().join("mnt");
        let dev_root = env.root().join("devices");
        let _mount = EnvGuard::set("DIRECT_CSI_MOUNT_ROOT", &mount_root.to_string_lossy());
        let _dev = EnvGuard::set("DIRECT_CSI_DEV_ROOT", &dev_root.to_string_lossy());

        let store = ObjectStore::with_partition("cli-install");
        install(&store).expect("install");
        assert!(mount_root.is_dir());
        assert!(dev_root.is_dir());
    }
}
