//! Profile storage and change notification.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};

use crate::color::ColorProfile;
use crate::error::{CoreError, CoreResult};
use crate::utils::{lock, read, write};

pub type ProfileCallback = Box<dyn Fn(&ColorProfile) + Send + Sync>;

/// Source of the active color profile.
pub trait ProfileStore: Send + Sync {
    fn active_profile(&self) -> ColorProfile;

    /// Switch to the profile named `id`. Unknown ids are rejected.
    fn set_active(&self, id: &str) -> CoreResult<()>;

    /// Register a callback run after every change of the active profile.
    fn on_profile_changed(&self, callback: ProfileCallback);

    fn profile_ids(&self) -> Vec<String>;
}

struct Profiles {
    by_id: BTreeMap<String, ColorProfile>,
    active: String,
}

/// Profile store backed by the configuration file's profile tables.
pub struct ConfigProfileStore {
    profiles: RwLock<Profiles>,
    callbacks: Mutex<Vec<Arc<dyn Fn(&ColorProfile) + Send + Sync>>>,
}

impl ConfigProfileStore {
    pub fn new(profiles: Vec<ColorProfile>, active: &str) -> CoreResult<Self> {
        Ok(Self {
            profiles: RwLock::new(Self::index(profiles, active)?),
            callbacks: Mutex::new(Vec::new()),
        })
    }

    /// Store holding a single profile, which is active.
    pub fn single(profile: ColorProfile) -> Self {
        let active = profile.id.clone();
        let mut by_id = BTreeMap::new();
        by_id.insert(active.clone(), profile);
        Self {
            profiles: RwLock::new(Profiles { by_id, active }),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    fn index(profiles: Vec<ColorProfile>, active: &str) -> CoreResult<Profiles> {
        let mut by_id = BTreeMap::new();
        for profile in profiles {
            profile.validate()?;
            if by_id.contains_key(&profile.id) {
                return Err(CoreError::InvalidInput(format!(
                    "duplicate profile id '{}'",
                    profile.id
                )));
            }
            by_id.insert(profile.id.clone(), profile);
        }
        if !by_id.contains_key(active) {
            return Err(CoreError::UnknownProfile(active.to_string()));
        }
        Ok(Profiles {
            by_id,
            active: active.to_string(),
        })
    }

    /// Replace every profile at once, as after a configuration reload.
    /// Callbacks fire when the resulting active profile differs.
    pub fn replace(&self, profiles: Vec<ColorProfile>, active: &str) -> CoreResult<()> {
        let next = Self::index(profiles, active)?;
        let changed = {
            let mut current = write(&self.profiles);
            let before = current.by_id.get(&current.active).cloned();
            *current = next;
            before.as_ref() != current.by_id.get(&current.active)
        };
        if changed {
            self.notify();
        }
        Ok(())
    }

    fn notify(&self) {
        let profile = self.active_profile();
        let callbacks: Vec<_> = lock(&self.callbacks).iter().cloned().collect();
        for callback in callbacks {
            callback(&profile);
        }
    }
}

impl ProfileStore for ConfigProfileStore {
    fn active_profile(&self) -> ColorProfile {
        let profiles = read(&self.profiles);
        profiles
            .by_id
            .get(&profiles.active)
            .cloned()
            .unwrap_or_default()
    }

    fn set_active(&self, id: &str) -> CoreResult<()> {
        {
            let mut profiles = write(&self.profiles);
            if !profiles.by_id.contains_key(id) {
                return Err(CoreError::UnknownProfile(id.to_string()));
            }
            if profiles.active == id {
                return Ok(());
            }
            profiles.active = id.to_string();
        }
        self.notify();
        Ok(())
    }

    fn on_profile_changed(&self, callback: ProfileCallback) {
        lock(&self.callbacks).push(Arc::from(callback));
    }

    fn profile_ids(&self) -> Vec<String> {
        read(&self.profiles).by_id.keys().cloned().collect()
    }
}
