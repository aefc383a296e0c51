use log::info;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::{Param, Storage};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Seed of the session's random generator. Sessions without a seed draw one from entropy.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SessionConfig {
    pub fn seeded(seed: u64) -> Self {
        Self { seed: Some(seed) }
    }
}

/// Holds the parameter values of a network along with the random generator used to
/// initialize them and to draw dropout masks.
#[derive(Debug, Clone)]
pub struct Session {
    config: SessionConfig,
    storage: Storage,
    rng: SmallRng,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            config,
            storage: Storage::default(),
            rng,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Build a new session with the same configuration and a blank state.
    pub fn restart(&self) -> Self {
        info!("Restarting session (seed: {:?})", self.config.seed);
        Session::new(self.config.clone())
    }

    /// Make sure the session can hold `len` parameter values.
    /// Returns whether the storage had to be allocated.
    pub fn bind(&mut self, len: usize) -> Result<bool> {
        if self.storage.len() == len {
            return Ok(false);
        }
        if !self.storage.is_empty() {
            return Err(Error::Shape(format!(
                "Session holds {} parameter values, but the network requires {}.",
                self.storage.len(),
                len
            )));
        }
        self.storage = Storage::zeroed(len);
        Ok(true)
    }

    /// Set each of the provided parameters to a fresh initial value.
    pub fn initialize<'a, I>(&mut self, params: I)
    where
        I: IntoIterator<Item = &'a Param>,
    {
        for param in params {
            let values = self.storage.get_mut(param.handle());
            param.init().fill(&mut self.rng, param.fan_in(), values);
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn rng(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Borrow the storage and the random generator at the same time.
    pub fn split(&mut self) -> (&mut Storage, &mut SmallRng) {
        (&mut self.storage, &mut self.rng)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new(SessionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initializer::Init;
    use crate::storage::Allocator;

    #[test]
    fn bind_allocates_once() {
        let mut session = Session::new(SessionConfig::seeded(1));
        assert!(session.bind(6).unwrap());
        assert!(!session.bind(6).unwrap());
        assert!(matches!(session.bind(7), Err(Error::Shape(_))));
    }

    #[test]
    fn seeded_sessions_are_reproducible() {
        let mut alloc = Allocator::new();
        let p = alloc.allocate(&[4, 3], Init::Xavier, 4);

        let mut a = Session::new(SessionConfig::seeded(7));
        let mut b = a.restart();
        for s in [&mut a, &mut b] {
            s.bind(alloc.len()).unwrap();
            s.initialize(std::iter::once(&p));
        }
        assert_eq!(a.storage(), b.storage());

        a.initialize(std::iter::once(&p));
        assert_ne!(a.storage(), b.storage());
    }
}
