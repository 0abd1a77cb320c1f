//! The seam to the battle simulation engine.
//!
//! The actual combat rules live outside this crate. The room layer
//! only needs the contract below: feed selections in, read state out,
//! pause and resume per-player clocks, and learn when the battle is
//! over. Implementations are synchronous; the service keeps each
//! simulation behind its room entry and serializes access.

use duelgrid_cluster::RoomState;
use duelgrid_protocol::{PlayerId, TimerSnapshot};
use serde_json::Value;

/// Errors a simulation can raise for a player-visible rejection.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    /// The submitted selection is not legal right now.
    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    /// The player is not part of this simulation.
    #[error("unknown player {0}")]
    UnknownPlayer(PlayerId),
}

/// One live battle, owned by exactly one instance.
pub trait BattleSimulation: Send {
    /// Submits a player's selection for the current decision point.
    fn submit_selection(
        &mut self,
        player_id: &PlayerId,
        selection: &Value,
    ) -> Result<(), SimulationError>;

    /// Selections currently legal for a player.
    fn available_selections(&self, player_id: &PlayerId) -> Result<Value, SimulationError>;

    /// The battle state as visible to one player.
    fn state_for(&self, player_id: &PlayerId) -> Result<Value, SimulationError>;

    /// Marks a player ready. Idempotent.
    fn player_ready(&mut self, player_id: &PlayerId);

    /// Records that a player gave up. The simulation resolves the
    /// battle in the opponent's favor.
    fn abandon(&mut self, player_id: &PlayerId);

    fn is_finished(&self) -> bool;

    /// Winner, once finished. `None` for a draw or an unfinished battle.
    fn winner(&self) -> Option<PlayerId>;

    // -- timers -------------------------------------------------------

    fn timer_enabled(&self) -> bool;

    /// Stops a player's clocks (disconnect grace). Idempotent.
    fn pause_timer(&mut self, player_id: &PlayerId);

    /// Restarts a paused player's clocks. Idempotent.
    fn resume_timer(&mut self, player_id: &PlayerId);

    fn timer_state(&self, player_id: &PlayerId) -> Option<TimerSnapshot>;

    fn all_timer_states(&self) -> Vec<TimerSnapshot>;

    fn timer_config(&self) -> Value;

    // -- animations ---------------------------------------------------

    /// Starts a tracked animation; returns its id.
    fn start_animation(&mut self, player_id: &PlayerId, data: &Value)
        -> Result<u64, SimulationError>;

    /// Ends a tracked animation. Unknown ids are ignored.
    fn end_animation(&mut self, animation_id: u64);

    /// Client-side report that an animation finished playing.
    fn report_animation_end(&mut self, player_id: &PlayerId, data: &Value);
}

/// Builds a simulation for a freshly created room.
pub trait SimulationFactory: Send + Sync + 'static {
    fn create(&self, room: &RoomState) -> Box<dyn BattleSimulation>;
}
