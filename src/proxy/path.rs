use crate::proxy::network::{ProxyDescription, ProxyNetworkDescription};

/// The current position of a connection attempt in the proxy network.
///
/// `indices[l]` is the candidate chosen at level `l` and `level` is the hop
/// currently being negotiated. The search is depth-first over the cross
/// product of levels: whenever the candidate at some level changes, every
/// deeper candidate restarts from 0, since a different upstream path may
/// reach proxies that were unreachable before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPath {
    level: usize,
    indices: Vec<usize>,
    sizes: Vec<usize>,
}

impl ProxyPath {
    /// The network must already be validated.
    pub fn new(network: &ProxyNetworkDescription) -> Self {
        let sizes: Vec<usize> = network.levels().iter().map(Vec::len).collect();
        ProxyPath {
            level: 0,
            indices: vec![0; sizes.len()],
            sizes,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Rewinds to the first hop without touching the chosen candidates.
    pub fn restart(&mut self) {
        self.level = 0;
    }

    /// Moves to the next hop after a successful negotiation. Returns `false`
    /// once every level has been traversed.
    pub fn descend(&mut self) -> bool {
        self.level += 1;
        self.level < self.sizes.len()
    }

    /// Zeroes the candidate at `from_level` and every deeper level.
    pub fn reset_suffix(&mut self, from_level: usize) {
        for index in self.indices.iter_mut().skip(from_level) {
            *index = 0;
        }
    }

    /// Resets the whole path for a fresh traversal.
    pub fn reset(&mut self) {
        self.level = 0;
        self.reset_suffix(0);
    }

    /// Marks the candidate at `level` as failed and picks the next one.
    ///
    /// If `level` is exhausted, its candidates restart from 0 and the level
    /// above advances instead, repeating while exhausted. Returns the level
    /// whose candidate changed, or `None` once level 0 is exhausted. The
    /// path is rewound to the first hop either way.
    pub fn advance(&mut self, level: usize) -> Option<usize> {
        let mut level = level;
        self.level = 0;
        loop {
            self.indices[level] += 1;
            if self.indices[level] < self.sizes[level] {
                self.reset_suffix(level + 1);
                return Some(level);
            }
            if level == 0 {
                return None;
            }
            level -= 1;
        }
    }

    /// The proxy at the current level.
    pub fn current<'a>(
        &self,
        network: &'a ProxyNetworkDescription,
    ) -> Option<&'a ProxyDescription> {
        let index = *self.indices.get(self.level)?;
        network.proxy(self.level, index)
    }

    /// The proxy the current level must reach, or `None` at the last level,
    /// where the next hop is the destination itself.
    pub fn next_hop<'a>(
        &self,
        network: &'a ProxyNetworkDescription,
    ) -> Option<&'a ProxyDescription> {
        let next = self.level + 1;
        if next < self.sizes.len() {
            network.proxy(next, self.indices[next])
        } else {
            None
        }
    }
}
