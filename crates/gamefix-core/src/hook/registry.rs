//! Process-wide record of hooked byte ranges.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use crate::error::{Error, Result};

static INSTALLED: Mutex<BTreeMap<usize, usize>> = Mutex::new(BTreeMap::new());

/// Reserve `address..address+len`, failing if it overlaps a reserved range.
pub(super) fn claim(address: usize, len: usize) -> Result<()> {
    let mut installed = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    let end = address.saturating_add(len);

    if let Some((&start, &existing_len)) = installed.range(..=address).next_back()
        && start + existing_len > address
    {
        return Err(Error::HookInstallConflict {
            address,
            existing: start,
        });
    }
    if let Some((&start, _)) = installed.range(address..end).next() {
        return Err(Error::HookInstallConflict {
            address,
            existing: start,
        });
    }

    installed.insert(address, len);
    Ok(())
}

pub(super) fn release(address: usize) {
    INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&address);
}
