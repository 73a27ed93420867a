//! Request fixtures shared by the benchmarks.

/// How a fixture is fed to the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Feed {
    /// All bytes in one call.
    Whole,
    /// Slices of the given size, as partial reads would deliver them.
    Chunks(usize),
    /// The fixture repeated back to back in one call.
    Pipelined(usize),
}

#[derive(Debug, Copy, Clone)]
pub struct RequestFixture {
    name: &'static str,
    content: &'static str,
}

impl RequestFixture {
    pub const fn new(name: &'static str, content: &'static str) -> Self {
        Self { name, content }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn content(&self) -> &'static str {
        self.content
    }

    /// The bytes one benchmark iteration feeds for `feed`.
    pub fn input(&self, feed: Feed) -> Vec<u8> {
        match feed {
            Feed::Whole | Feed::Chunks(_) => self.content.as_bytes().to_vec(),
            Feed::Pipelined(n) => self.content.repeat(n).into_bytes(),
        }
    }

    /// How many requests `input(feed)` holds.
    pub fn requests(&self, feed: Feed) -> usize {
        match feed {
            Feed::Pipelined(n) => n,
            Feed::Whole | Feed::Chunks(_) => 1,
        }
    }
}
