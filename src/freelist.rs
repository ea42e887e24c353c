use crate::{
    arena::Run,
    list::{IndexList, Linked, Links},
};

/// List of the released [`Run`] records of an arena.
///
/// This list only stores indices into the arena's run table. The reason behind
/// this is that a released run does not need any content of its own, we just
/// need to be able to find it again. The links live inside of the run records.
///
/// ```text
///                          Free List
///
///                 +-----------------------------+
///                 |                             |
/// +---------------|-----------------------------|---------------+
/// | +-----------+ | +-----------+ +-----------+ | +-----------+ |
/// | | ALLOCATED | +-| RELEASED  | | ALLOCATED | +-| RELEASED  | |
/// | +-----------+   +-----------+ +-----------+   +-----------+ |
/// +-------------------------------------------------------------+
///                            Arena
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct FreeRuns {
    items: IndexList,
}

impl Linked for Run {
    fn links(&self) -> &Links {
        &self.links
    }

    fn links_mut(&mut self) -> &mut Links {
        &mut self.links
    }
}

impl FreeRuns {
    pub const fn new() -> Self {
        Self { items: IndexList::new() }
    }

    #[inline]
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn insert(&mut self, runs: &mut [Run], index: u32) {
        self.items.push_back(runs, index);
    }

    pub fn remove(&mut self, runs: &mut [Run], index: u32) {
        self.items.remove(runs, index);
    }

    /// Returns the first released run that can hold `size` bytes.
    ///
    /// This is the first-fit algorithm, the list is walked in insertion order
    /// and the first run big enough wins.
    pub fn find_fit(&self, runs: &[Run], size: usize) -> Option<u32> {
        self.items.iter(runs).find(|&index| runs[index as usize].size >= size)
    }

    /// Returns the released run that covers the whole range `[addr, addr + size)`.
    pub fn find_containing(&self, runs: &[Run], addr: usize, size: usize) -> Option<u32> {
        self.items.iter(runs).find(|&index| {
            let run = &runs[index as usize];
            run.addr <= addr && addr + size <= run.addr + run.size
        })
    }

    /// Indices of every released run, in list order.
    #[cfg(test)]
    pub fn indices<'a>(&self, runs: &'a [Run]) -> crate::list::IndexIter<'a, Run> {
        self.items.iter(runs)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::RunState;

    fn run(addr: usize, size: usize) -> Run {
        Run {
            addr,
            size,
            state: RunState::Released,
            ..Default::default()
        }
    }

    #[test]
    fn first_fit_follows_list_order() {
        let mut runs = vec![run(0, 64), run(64, 256), run(320, 128)];
        let mut free = FreeRuns::new();

        for i in 0..3 {
            free.insert(&mut runs, i);
        }

        assert_eq!(free.find_fit(&runs, 100), Some(1));
        assert_eq!(free.find_fit(&runs, 64), Some(0));
        assert_eq!(free.find_fit(&runs, 512), None);

        free.remove(&mut runs, 1);
        assert_eq!(free.find_fit(&runs, 100), Some(2));
        assert_eq!(free.len(), 2);
    }

    #[test]
    fn containment_search() {
        let mut runs = vec![run(0, 64), run(64, 256)];
        let mut free = FreeRuns::new();

        free.insert(&mut runs, 0);
        free.insert(&mut runs, 1);

        assert_eq!(free.find_containing(&runs, 128, 64), Some(1));
        assert_eq!(free.find_containing(&runs, 32, 64), None);
        assert_eq!(free.find_containing(&runs, 0, 64), Some(0));
    }
}
