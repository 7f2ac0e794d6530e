//! [`ConfigStore`] over the live Windows registry.
//!
//! Key paths are handed to the registry as they are, so `Wow6432Node`
//! paths built by the caller address the 32-bit view explicitly.

use std::io;

use winreg::RegKey;
use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ, KEY_WRITE};
use winreg::types::FromRegValue;

use super::{ConfigStore, Hive, StoreError, normalize};

/// `ERROR_BAD_FILE_TYPE`, returned when a value has another type.
const BAD_FILE_TYPE: i32 = 222;

#[derive(Debug, Default, Clone, Copy)]
pub struct RegistryStore;

impl RegistryStore {
    pub fn new() -> Self {
        Self
    }
}

fn predef(hive: Hive) -> RegKey {
    RegKey::predef(match hive {
        Hive::CurrentUser => HKEY_CURRENT_USER,
        Hive::LocalMachine => HKEY_LOCAL_MACHINE,
    })
}

/// Open `key`; a missing key is `None`.
fn open(hive: Hive, key: &str, access: u32) -> Result<Option<RegKey>, StoreError> {
    match predef(hive).open_subkey_with_flags(normalize(key), access) {
        Ok(k) => Ok(Some(k)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read<T: FromRegValue>(
    hive: Hive,
    key: &str,
    name: &str,
    expected: &'static str,
) -> Result<Option<T>, StoreError> {
    let Some(k) = open(hive, key, KEY_READ)? else {
        return Ok(None);
    };
    match k.get_value::<T, _>(name) {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) if e.raw_os_error() == Some(BAD_FILE_TYPE) => Err(StoreError::WrongType {
            key: key.to_string(),
            name: name.to_string(),
            expected,
        }),
        Err(e) => Err(e.into()),
    }
}

impl ConfigStore for RegistryStore {
    fn read_string(&self, hive: Hive, key: &str, name: &str) -> Result<Option<String>, StoreError> {
        read(hive, key, name, "string")
    }

    fn read_u32(&self, hive: Hive, key: &str, name: &str) -> Result<Option<u32>, StoreError> {
        read(hive, key, name, "32-bit value")
    }

    fn subkeys(&self, hive: Hive, key: &str) -> Result<Vec<String>, StoreError> {
        let Some(k) = open(hive, key, KEY_READ)? else {
            return Ok(Vec::new());
        };
        Ok(k.enum_keys().collect::<io::Result<Vec<_>>>()?)
    }

    fn write_string(&self, hive: Hive, key: &str, name: &str, value: &str) -> Result<(), StoreError> {
        let (k, _) = predef(hive).create_subkey(normalize(key))?;
        k.set_value(name, &value.to_string())?;
        Ok(())
    }

    fn write_u32(&self, hive: Hive, key: &str, name: &str, value: u32) -> Result<(), StoreError> {
        let (k, _) = predef(hive).create_subkey(normalize(key))?;
        k.set_value(name, &value)?;
        Ok(())
    }

    fn delete_value(&self, hive: Hive, key: &str, name: &str) -> Result<(), StoreError> {
        let Some(k) = open(hive, key, KEY_READ | KEY_WRITE)? else {
            return Ok(());
        };
        match k.delete_value(name) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
