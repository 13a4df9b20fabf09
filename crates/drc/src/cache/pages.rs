//! Per-page block lists: the ground truth behind the hash table.

use rustc_hash::FxHashMap;

use drc_state::InvalidCode;

use super::arena::BlockId;

/// What the cache knows about one guest page.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PageState {
    /// No translation was ever built from the page.
    #[default]
    Uncompiled,
    /// Translations exist and stores to the page notify the translator.
    Clean,
    /// Some translations may be stale and are verified before use.
    Dirty,
    /// Translations were dropped after a write; compiles start over.
    Invalidated,
}

#[derive(Debug, Default)]
pub(crate) struct Page {
    pub(crate) state: PageState,
    pub(crate) clean: Vec<BlockId>,
    pub(crate) dirty: Vec<BlockId>,
}

impl Page {
    fn is_empty(&self) -> bool {
        self.clean.is_empty() && self.dirty.is_empty()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PageTable {
    pages: FxHashMap<u32, Page>,
}

fn remove_id(list: &mut Vec<BlockId>, id: BlockId) -> bool {
    match list.iter().position(|&x| x == id) {
        Some(i) => {
            list.swap_remove(i);
            true
        }
        None => false,
    }
}

impl PageTable {
    pub(crate) fn get(&self, page: u32) -> Option<&Page> {
        self.pages.get(&page)
    }

    pub(crate) fn state(&self, page: u32) -> PageState {
        self.pages.get(&page).map_or(PageState::Uncompiled, |p| p.state)
    }

    pub(crate) fn clean(&self, page: u32) -> &[BlockId] {
        self.pages.get(&page).map_or(&[], |p| &p.clean)
    }

    pub(crate) fn dirty(&self, page: u32) -> &[BlockId] {
        self.pages.get(&page).map_or(&[], |p| &p.dirty)
    }

    pub(crate) fn add_clean(&mut self, page: u32, id: BlockId, invalid: &mut InvalidCode) {
        let entry = self.pages.entry(page).or_default();
        entry.clean.push(id);
        self.refresh(page, invalid);
    }

    pub(crate) fn mark_dirty(&mut self, page: u32, id: BlockId, invalid: &mut InvalidCode) {
        if let Some(p) = self.pages.get_mut(&page)
            && remove_id(&mut p.clean, id)
        {
            p.dirty.push(id);
        }
        self.refresh(page, invalid);
    }

    pub(crate) fn mark_clean(&mut self, page: u32, id: BlockId, invalid: &mut InvalidCode) {
        if let Some(p) = self.pages.get_mut(&page)
            && remove_id(&mut p.dirty, id)
        {
            p.clean.push(id);
        }
        self.refresh(page, invalid);
    }

    /// Drop `id` from `page`. `invalidated` records why the page may now be empty.
    pub(crate) fn remove(&mut self, page: u32, id: BlockId, invalidated: bool, invalid: &mut InvalidCode) {
        let Some(p) = self.pages.get_mut(&page) else { return };
        let found = remove_id(&mut p.clean, id) | remove_id(&mut p.dirty, id);
        if found && p.is_empty() {
            p.state = if invalidated {
                PageState::Invalidated
            } else {
                PageState::Uncompiled
            };
        }
        self.refresh(page, invalid);
    }

    /// Recompute the state of `page` and its store-notify flag.
    fn refresh(&mut self, page: u32, invalid: &mut InvalidCode) {
        let Some(p) = self.pages.get_mut(&page) else { return };
        if !p.dirty.is_empty() {
            p.state = PageState::Dirty;
        } else if !p.clean.is_empty() {
            p.state = PageState::Clean;
        }
        if p.clean.is_empty() {
            invalid.mark_invalid(page);
        } else {
            invalid.mark_compiled(page);
        }
        if p.is_empty() && p.state == PageState::Uncompiled {
            self.pages.remove(&page);
        }
    }

    /// Pages holding at least one block.
    pub(crate) fn compiled(&self) -> usize {
        self.pages.values().filter(|p| !p.is_empty()).count()
    }

    pub(crate) fn clear(&mut self) {
        self.pages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::arena::BlockArena;
    use crate::cache::tests::dummy_block;

    #[test]
    fn test_state_follows_lists() {
        let mut arena = BlockArena::default();
        let a = arena.insert(dummy_block(0x1000));
        let b = arena.insert(dummy_block(0x1100));
        let mut invalid = InvalidCode::new();
        let mut pages = PageTable::default();

        assert_eq!(pages.state(1), PageState::Uncompiled);
        pages.add_clean(1, a, &mut invalid);
        pages.add_clean(1, b, &mut invalid);
        assert_eq!(pages.state(1), PageState::Clean);
        assert!(!invalid.is_invalid(1));

        pages.mark_dirty(1, a, &mut invalid);
        assert_eq!(pages.state(1), PageState::Dirty);
        assert_eq!(pages.dirty(1), &[a]);
        // b is still clean, so stores keep notifying
        assert!(!invalid.is_invalid(1));

        pages.mark_dirty(1, b, &mut invalid);
        assert!(invalid.is_invalid(1));
        pages.mark_clean(1, b, &mut invalid);
        assert!(!invalid.is_invalid(1));

        pages.remove(1, a, true, &mut invalid);
        assert_eq!(pages.state(1), PageState::Clean);
        pages.remove(1, b, true, &mut invalid);
        assert_eq!(pages.state(1), PageState::Invalidated);
        assert!(invalid.is_invalid(1));
        assert_eq!(pages.compiled(), 0);
    }

    #[test]
    fn test_expired_page_forgets_itself() {
        let mut arena = BlockArena::default();
        let a = arena.insert(dummy_block(0x2000));
        let mut invalid = InvalidCode::new();
        let mut pages = PageTable::default();
        pages.add_clean(2, a, &mut invalid);
        pages.remove(2, a, false, &mut invalid);
        assert_eq!(pages.state(2), PageState::Uncompiled);
        assert!(pages.get(2).is_none());
    }
}
