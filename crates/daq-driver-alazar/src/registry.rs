//! Connected boards, keyed by board id.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;

use daq_core::limits::MAX_NUM_BOARDS;
use tracing::{info, warn};

use crate::api::AlazarApi;
use crate::board::AlazarBoard;
use crate::error::{AlazarError, Result};
use crate::sim::SimulatedAlazar;

type Factory<A> = Box<dyn Fn(u32) -> A + Send + Sync>;

/// Owns every connected [`AlazarBoard`].
pub struct BoardRegistry<A: AlazarApi> {
    boards: BTreeMap<u32, AlazarBoard<A>>,
    factory: Factory<A>,
    max_boards: u32,
}

impl<A: AlazarApi> BoardRegistry<A> {
    /// `factory` builds the SDK binding for a board id.
    pub fn new(factory: impl Fn(u32) -> A + Send + Sync + 'static) -> Self {
        Self {
            boards: BTreeMap::new(),
            factory: Box::new(factory),
            max_boards: MAX_NUM_BOARDS,
        }
    }

    /// Accept board ids up to `max_boards`.
    #[must_use]
    pub fn with_max_boards(mut self, max_boards: u32) -> Self {
        self.max_boards = max_boards;
        self
    }

    /// Connect board `id`, logging its system information.
    ///
    /// Connecting an already-connected board is a no-op.
    pub fn connect(&mut self, id: u32) -> Result<&mut AlazarBoard<A>> {
        if id == 0 || id > self.max_boards {
            return Err(AlazarError::Configuration(format!(
                "board id {id} outside 1..={}",
                self.max_boards
            )));
        }
        match self.boards.entry(id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let board = AlazarBoard::new(id, Arc::new((self.factory)(id)));
                board.sys_info()?;
                info!(board_id = id, "board connected");
                Ok(entry.insert(board))
            }
        }
    }

    /// Connected board `id`.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<&AlazarBoard<A>> {
        self.boards.get(&id)
    }

    /// Connected board `id`, mutably.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut AlazarBoard<A>> {
        self.boards.get_mut(&id)
    }

    /// Stop board `id` if it is acquiring and forget it.
    pub fn disconnect(&mut self, id: u32) -> Result<()> {
        let Some(mut board) = self.boards.remove(&id) else {
            warn!(board_id = id, "disconnect of unknown board");
            return Ok(());
        };
        let stopped = board.stop();
        info!(board_id = id, "board disconnected");
        stopped
    }

    /// Number of connected boards.
    #[must_use]
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    /// Ids of the connected boards, ascending.
    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.boards.keys().copied()
    }

    /// One-line description of a connected board.
    pub fn board_info(&self, id: u32) -> Result<String> {
        let board = self
            .boards
            .get(&id)
            .ok_or_else(|| AlazarError::Configuration(format!("board {id} is not connected")))?;
        Ok(board.sys_info()?.to_string())
    }
}

impl BoardRegistry<SimulatedAlazar> {
    /// Registry whose boards are all simulated.
    #[must_use]
    pub fn simulated() -> Self {
        Self::new(|_| SimulatedAlazar::new())
    }
}
