//! Security keystore: the application-layer secure-communication keystore
//! consumed from a verified keyring (`spec.md` §4.7, §6.3).

use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use dashmap::DashMap;

use crate::crypto::Key16;
use crate::error::{Error, Result};
use crate::types::{GroupAddress, IndividualAddress, SerialNumber};

/// An encrypted key artifact as stored in a keyring, opaque to this crate
/// until decrypted under the keyring password.
#[derive(Debug, Clone)]
pub struct EncryptedKey(pub Vec<u8>);

/// A keyring device entry (`spec.md` §6.3).
#[derive(Debug, Clone, Default)]
pub struct KeyringDevice {
    pub tool_key: Option<EncryptedKey>,
}

/// A keyring interface entry: a host's declared groups and their sender sets
/// (`spec.md` §6.3).
#[derive(Debug, Clone)]
pub struct KeyringInterface {
    pub address: IndividualAddress,
    pub groups: HashMap<GroupAddress, HashSet<IndividualAddress>>,
}

/// The keyring interface this core consumes. XML parsing and signature
/// verification live outside this crate's scope (`spec.md` §1); callers
/// supply an implementation that has already loaded the artifact.
pub trait KeyringSource {
    /// Verifies the keyring's embedded signature against `password`.
    fn verify_signature(&self, password: &str) -> bool;

    /// All devices declared in the keyring.
    fn devices(&self) -> HashMap<IndividualAddress, KeyringDevice>;

    /// All group (datapoint) keys declared in the keyring, still encrypted.
    fn groups(&self) -> HashMap<GroupAddress, EncryptedKey>;

    /// All interfaces, keyed by host address, each declaring its groups and
    /// senders.
    fn interfaces(&self) -> HashMap<String, Vec<KeyringInterface>>;

    /// Decrypts an encrypted key artifact under `password`.
    fn decrypt_key(&self, encrypted: &EncryptedKey, password: &str) -> Result<Key16>;
}

/// Process-wide or caller-local mapping from device/group addresses to
/// secure-communication keys, populated by [`Security::use_keyring`].
///
/// Accessors return the underlying concurrent maps directly: callers may
/// mutate them freely, matching `spec.md` §4.7's "no defensive copies" rule.
pub struct Security {
    device_tool_keys: DashMap<IndividualAddress, Key16>,
    group_keys: DashMap<GroupAddress, Key16>,
    group_senders: DashMap<GroupAddress, HashSet<IndividualAddress>>,
    senders_by_interface: DashMap<IndividualAddress, HashMap<GroupAddress, HashSet<IndividualAddress>>>,
    broadcast_tool_keys: DashMap<SerialNumber, Key16>,
}

static DEFAULT_INSTALLATION: OnceLock<Security> = OnceLock::new();

impl Security {
    /// Creates an independent keystore instance (`spec.md` §6.2).
    pub fn new() -> Self {
        Self {
            device_tool_keys: DashMap::new(),
            group_keys: DashMap::new(),
            group_senders: DashMap::new(),
            senders_by_interface: DashMap::new(),
            broadcast_tool_keys: DashMap::new(),
        }
    }

    /// The process-wide default keystore instance (`spec.md` §4.7, §6.2).
    pub fn default_installation() -> &'static Security {
        DEFAULT_INSTALLATION.get_or_init(Security::new)
    }

    /// Live view of device tool keys.
    pub fn device_tool_keys(&self) -> &DashMap<IndividualAddress, Key16> {
        &self.device_tool_keys
    }

    /// Live view of group (datapoint) keys.
    pub fn group_keys(&self) -> &DashMap<GroupAddress, Key16> {
        &self.group_keys
    }

    /// Live view of group senders, filtered per `use_keyring`'s own-address rule.
    pub fn group_senders(&self) -> &DashMap<GroupAddress, HashSet<IndividualAddress>> {
        &self.group_senders
    }

    /// Live view of each interface's unfiltered group-sender snapshot.
    pub fn senders_by_interface(
        &self,
    ) -> &DashMap<IndividualAddress, HashMap<GroupAddress, HashSet<IndividualAddress>>> {
        &self.senders_by_interface
    }

    /// Live view of broadcast tool keys keyed by sender serial number.
    pub fn broadcast_tool_keys(&self) -> &DashMap<SerialNumber, Key16> {
        &self.broadcast_tool_keys
    }

    /// Ingests a verified keyring (`spec.md` §4.7). Re-ingesting the same
    /// keyring and password is idempotent: the derived `group_senders` and
    /// `senders_by_interface` maps are rebuilt from scratch each call so
    /// stale interface/group entries from a prior ingest cannot linger.
    pub fn use_keyring(&self, keyring: &dyn KeyringSource, password: &str) -> Result<()> {
        if !keyring.verify_signature(password) {
            return Err(Error::KeyringSignatureMismatch);
        }

        for (addr, device) in keyring.devices() {
            if let Some(encrypted) = &device.tool_key {
                let key = keyring.decrypt_key(encrypted, password)?;
                self.device_tool_keys.insert(addr, key);
            }
        }

        for (group, encrypted) in keyring.groups() {
            let key = keyring.decrypt_key(&encrypted, password)?;
            self.group_keys.insert(group, key);
        }

        self.group_senders.clear();
        self.senders_by_interface.clear();

        for interfaces in keyring.interfaces().into_values() {
            for iface in interfaces {
                for (group, senders) in &iface.groups {
                    let filtered: HashSet<IndividualAddress> = senders
                        .iter()
                        .copied()
                        .filter(|sender| *sender != iface.address)
                        .collect();
                    self.group_senders
                        .entry(*group)
                        .or_default()
                        .extend(filtered);
                }
                self.senders_by_interface
                    .insert(iface.address, iface.groups.clone());
            }
        }

        Ok(())
    }
}

impl Default for Security {
    fn default() -> Self {
        Self::new()
    }
}
