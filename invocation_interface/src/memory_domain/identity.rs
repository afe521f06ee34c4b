use crate::memory_domain::AddressTranslator;

/// Translator for domains sharing one address space, every non-null address maps to itself
#[derive(Debug, Default)]
pub struct IdentityTranslator {}

impl AddressTranslator for IdentityTranslator {
    fn to_remote(&self, local: usize, size: usize) -> Option<u64> {
        if local == 0 || local.checked_add(size).is_none() {
            return None;
        }
        u64::try_from(local).ok()
    }

    fn to_local(&self, remote: u64, size: usize) -> Option<usize> {
        let local = usize::try_from(remote).ok()?;
        if local == 0 || local.checked_add(size).is_none() {
            return None;
        }
        Some(local)
    }
}
