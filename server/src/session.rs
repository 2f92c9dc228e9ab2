//! Session and race timing.
//!
//! Exactly one [`SessionState`] is current at any time. It is created when a
//! session starts, with one [`EntryCarResult`] per slot, and replaced
//! wholesale when the rotation moves on. Lap reports from connections and the
//! session-over check from the tick loop both go through [`SessionManager`],
//! which serialises them behind one lock so the lap rules always see a
//! consistent leader state.

use crate::slots::SlotId;
use log::{debug, info};
use parking_lot::Mutex;
use shared::packets::{CurrentSessionUpdate, LapCompletedIn, LapStanding};
use shared::{SessionConfig, SessionType};

/// Best lap value for a car that has not completed a counted lap.
pub const NO_LAP_TIME: u32 = 999_999_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCarResult {
    pub num_laps: u32,
    pub last_lap: u32,
    pub best_lap: u32,
    /// Session time at the end of the last counted lap, latency compensated.
    pub total_time: u32,
    pub has_completed_last_lap: bool,
}

impl Default for EntryCarResult {
    fn default() -> Self {
        Self {
            num_laps: 0,
            last_lap: NO_LAP_TIME,
            best_lap: NO_LAP_TIME,
            total_time: 0,
            has_completed_last_lap: false,
        }
    }
}

/// Mutable state of the running session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub config: SessionConfig,
    /// Position of `config` in the rotation.
    pub index: usize,
    pub start_ms: i64,
    /// Server time the session was decided, 0 while undetermined.
    pub end_time: i64,
    pub leader_lap_count: u32,
    pub leader_has_completed_last_lap: bool,
    /// Raised once a timed session has run out of time.
    pub session_over_flag: bool,
    /// Lap the leader must finish when an extra lap is driven, 0 until known.
    pub target_lap: u32,
    pub grid: Vec<SlotId>,
    results: Vec<EntryCarResult>,
}

impl SessionState {
    pub fn new(config: SessionConfig, index: usize, start_ms: i64, slot_count: usize, grid: Vec<SlotId>) -> Self {
        Self {
            config,
            index,
            start_ms,
            end_time: 0,
            leader_lap_count: 0,
            leader_has_completed_last_lap: false,
            session_over_flag: false,
            target_lap: 0,
            grid,
            results: vec![EntryCarResult::default(); slot_count],
        }
    }

    pub fn session_time_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.start_ms
    }

    /// Time remaining. Infinite sessions always report their full length.
    pub fn time_left_ms(&self, now_ms: i64) -> i64 {
        if self.config.infinite {
            self.config.time_ms()
        } else {
            self.start_ms + self.config.time_ms() - now_ms
        }
    }

    pub fn result(&self, slot_id: SlotId) -> Option<&EntryCarResult> {
        self.results.get(slot_id as usize)
    }

    pub fn results(&self) -> &[EntryCarResult] {
        &self.results
    }

    /// Applies a lap report and returns whether it should be broadcast.
    ///
    /// Reports from cars that already finished, or that would exceed the lap
    /// target of an untimed race, change nothing.
    pub fn on_lap_completed(
        &mut self,
        slot_id: SlotId,
        lap: &LapCompletedIn,
        ping: u16,
        now_ms: i64,
        has_extra_lap: bool,
    ) -> bool {
        let session_time = self.session_time_ms(now_ms);
        let is_race = self.config.session_type == SessionType::Race;
        let is_timed_race = self.config.is_timed_race();
        let target_laps = self.config.laps;

        let Some(result) = self.results.get_mut(slot_id as usize) else {
            return false;
        };
        if result.has_completed_last_lap {
            debug!("Lap from slot {} rejected, already finished", slot_id);
            return false;
        }
        if is_race && result.num_laps >= target_laps && !is_timed_race {
            debug!("Lap from slot {} rejected, race over", slot_id);
            return false;
        }

        if !is_race && lap.cuts > 0 {
            // Cut laps never count, but still finish a car once the end is known.
            if self.end_time == 0 {
                return true;
            }
            result.has_completed_last_lap = true;
            return false;
        }

        // Judged against the lead held before this crossing.
        let takes_lead = result.num_laps + 1 > self.leader_lap_count;

        result.last_lap = lap.lap_time;
        result.best_lap = result.best_lap.min(lap.lap_time);
        result.num_laps += 1;
        if result.num_laps > self.leader_lap_count {
            self.leader_lap_count = result.num_laps;
        }
        result.total_time = (session_time - ping as i64 / 2).max(0) as u32;

        if self.session_over_flag {
            if is_race && is_timed_race {
                if !takes_lead {
                    result.has_completed_last_lap = self.leader_has_completed_last_lap;
                } else if !has_extra_lap {
                    self.leader_has_completed_last_lap = true;
                    result.has_completed_last_lap = true;
                } else if self.target_lap == 0 {
                    self.target_lap = result.num_laps + 1;
                } else if result.num_laps >= self.target_lap {
                    self.leader_has_completed_last_lap = true;
                    result.has_completed_last_lap = true;
                }
            } else {
                result.has_completed_last_lap = true;
            }
        }

        if !is_race {
            if self.session_over_flag && self.end_time == 0 {
                self.end_time = now_ms;
            }
            if self.end_time != 0 {
                result.has_completed_last_lap = true;
            }
        } else if is_timed_race {
            if self.leader_has_completed_last_lap && self.end_time == 0 {
                self.end_time = now_ms;
            }
        } else if result.num_laps != target_laps {
            if self.end_time != 0 {
                result.has_completed_last_lap = true;
            }
        } else {
            result.has_completed_last_lap = true;
            if self.end_time == 0 {
                self.end_time = now_ms;
            }
        }

        true
    }

    /// Standings ordered for display: races by laps then total time, other
    /// sessions by best lap.
    pub fn standings(&self) -> Vec<LapStanding> {
        let is_race = self.config.session_type == SessionType::Race;
        let mut rows: Vec<(SlotId, &EntryCarResult)> = self
            .results
            .iter()
            .enumerate()
            .map(|(id, result)| (id as SlotId, result))
            .collect();

        if is_race {
            rows.sort_by(|(a_id, a), (b_id, b)| {
                b.num_laps
                    .cmp(&a.num_laps)
                    .then(a.total_time.cmp(&b.total_time))
                    .then(a_id.cmp(b_id))
            });
        } else {
            rows.sort_by(|(a_id, a), (b_id, b)| a.best_lap.cmp(&b.best_lap).then(a_id.cmp(b_id)));
        }

        rows.into_iter()
            .map(|(slot_id, result)| LapStanding {
                slot_id,
                lap_time: if is_race { result.total_time } else { result.best_lap },
                num_laps: result.num_laps.min(u16::MAX as u32) as u16,
                has_completed_last_lap: result.has_completed_last_lap,
            })
            .collect()
    }

    /// Grid for the next session: cars with a lap by best lap, then the rest.
    fn next_grid(&self) -> Vec<SlotId> {
        let mut order: Vec<SlotId> = (0..self.results.len()).map(|id| id as SlotId).collect();
        order.sort_by_key(|id| (self.results[*id as usize].best_lap, *id));
        order
    }
}

/// Owns the session rotation and the current state.
pub struct SessionManager {
    sessions: Vec<SessionConfig>,
    current: Mutex<SessionState>,
    slot_count: usize,
    race_over_time_ms: i64,
    has_extra_lap: bool,
}

impl SessionManager {
    /// Starts the first configured session at `now_ms`.
    ///
    /// `sessions` must not be empty; configuration validation guarantees it.
    pub fn new(
        sessions: Vec<SessionConfig>,
        slot_count: usize,
        race_over_time_ms: i64,
        has_extra_lap: bool,
        now_ms: i64,
    ) -> Self {
        let first = sessions
            .first()
            .cloned()
            .unwrap_or_else(|| SessionConfig::practice(0, 0));
        let grid = (0..slot_count).map(|id| id as SlotId).collect();
        Self {
            current: Mutex::new(SessionState::new(first, 0, now_ms, slot_count, grid)),
            sessions,
            slot_count,
            race_over_time_ms,
            has_extra_lap,
        }
    }

    pub fn sessions(&self) -> &[SessionConfig] {
        &self.sessions
    }

    /// Runs `f` against the current state.
    pub fn with_current<R>(&self, f: impl FnOnce(&SessionState) -> R) -> R {
        f(&self.current.lock())
    }

    pub fn current_config(&self) -> SessionConfig {
        self.current.lock().config.clone()
    }

    pub fn current_type(&self) -> SessionType {
        self.current.lock().config.session_type
    }

    pub fn is_open(&self) -> bool {
        self.current.lock().config.is_open
    }

    pub fn result(&self, slot_id: SlotId) -> Option<EntryCarResult> {
        self.current.lock().result(slot_id).copied()
    }

    pub fn standings(&self) -> Vec<LapStanding> {
        self.current.lock().standings()
    }

    /// Applies a lap report to the current session.
    pub fn on_lap_completed(&self, slot_id: SlotId, lap: &LapCompletedIn, ping: u16, now_ms: i64) -> bool {
        self.current
            .lock()
            .on_lap_completed(slot_id, lap, ping, now_ms, self.has_extra_lap)
    }

    /// Per-tick evaluation. Returns true when the session is over and the
    /// rotation should advance.
    pub fn update(&self, now_ms: i64) -> bool {
        let mut state = self.current.lock();
        let config = &state.config;

        if config.session_type != SessionType::Race {
            return !config.infinite && state.time_left_ms(now_ms) < 0;
        }

        if config.is_timed_race() && !config.infinite && !state.session_over_flag && state.time_left_ms(now_ms) < 0 {
            info!("Time is up in {}, the leader's next lap is the last", config.name);
            state.session_over_flag = true;
        }

        state.end_time != 0 && now_ms - state.end_time > self.race_over_time_ms
    }

    /// Moves to the next session in the rotation, wrapping around, and
    /// returns its configuration.
    pub fn next_session(&self, now_ms: i64) -> SessionConfig {
        let mut state = self.current.lock();
        let index = (state.index + 1) % self.sessions.len().max(1);
        let config = self
            .sessions
            .get(index)
            .cloned()
            .unwrap_or_else(|| state.config.clone());
        let grid = state.next_grid();

        info!("Next session: {} ({:?})", config.name, config.session_type);
        *state = SessionState::new(config.clone(), index, now_ms, self.slot_count, grid);
        config
    }

    /// Session packet for a client whose clock runs `time_offset` behind ours.
    pub fn session_update(&self, time_offset: i64, track_grip: f32) -> CurrentSessionUpdate {
        let state = self.current.lock();
        CurrentSessionUpdate {
            session: state.config.clone(),
            track_grip,
            grid: state.grid.clone(),
            start_time: state.start_ms - time_offset,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lap(lap_time: u32, cuts: u8) -> LapCompletedIn {
        LapCompletedIn {
            timestamp: 0,
            lap_time,
            cuts,
        }
    }

    fn race(laps: u32, time_minutes: u32) -> SessionState {
        SessionState::new(SessionConfig::race(0, laps, time_minutes), 0, 0, 4, vec![0, 1, 2, 3])
    }

    #[test]
    fn final_lap_of_fixed_race_finishes_car_and_sets_end_time() {
        let mut state = race(5, 0);
        state.results[1] = EntryCarResult {
            num_laps: 4,
            best_lap: 97_000,
            ..Default::default()
        };

        assert!(state.on_lap_completed(1, &lap(95_000, 0), 0, 500_000, false));

        let result = state.result(1).unwrap();
        assert_eq!(result.num_laps, 5);
        assert_eq!(result.last_lap, 95_000);
        assert_eq!(result.best_lap, 95_000);
        assert!(result.has_completed_last_lap);
        assert_eq!(state.end_time, 500_000);
    }

    #[test]
    fn finished_car_reports_are_rejected_without_change() {
        let mut state = race(5, 0);
        state.results[0].has_completed_last_lap = true;
        let before = *state.result(0).unwrap();

        assert!(!state.on_lap_completed(0, &lap(90_000, 0), 0, 1_000, false));
        assert_eq!(*state.result(0).unwrap(), before);
    }

    #[test]
    fn laps_beyond_target_are_rejected_in_untimed_race() {
        let mut state = race(3, 0);
        state.results[2].num_laps = 3;
        assert!(!state.on_lap_completed(2, &lap(90_000, 0), 0, 1_000, false));
        assert_eq!(state.result(2).unwrap().num_laps, 3);
    }

    #[test]
    fn other_cars_finish_after_the_leader() {
        let mut state = race(2, 0);
        state.results[0].num_laps = 1;
        state.results[1].num_laps = 0;

        assert!(state.on_lap_completed(0, &lap(60_000, 0), 0, 120_000, false));
        assert_eq!(state.end_time, 120_000);

        assert!(state.on_lap_completed(1, &lap(61_000, 0), 0, 125_000, false));
        assert!(state.result(1).unwrap().has_completed_last_lap);
        assert_eq!(state.result(1).unwrap().num_laps, 1);
        assert_eq!(state.end_time, 120_000);
    }

    #[test]
    fn best_lap_is_the_minimum_and_laps_strictly_increase() {
        let mut state = SessionState::new(SessionConfig::practice(0, 30), 0, 0, 2, vec![0, 1]);
        let times = [92_000, 90_500, 91_000];
        for (i, time) in times.iter().enumerate() {
            assert!(state.on_lap_completed(0, &lap(*time, 0), 0, 100_000 * (i as i64 + 1), false));
            assert_eq!(state.result(0).unwrap().num_laps, i as u32 + 1);
        }
        let result = state.result(0).unwrap();
        assert_eq!(result.best_lap, 90_500);
        assert_eq!(result.last_lap, 91_000);
    }

    #[test]
    fn total_time_is_latency_compensated() {
        let mut state = race(10, 0);
        state.start_ms = 1_000;
        state.on_lap_completed(0, &lap(80_000, 0), 120, 81_000, false);
        assert_eq!(state.result(0).unwrap().total_time, 80_000 - 60);
    }

    #[test]
    fn cut_lap_outside_race_does_not_count() {
        let mut state = SessionState::new(SessionConfig::qualifying(1, 15), 1, 0, 2, vec![0, 1]);
        assert!(state.on_lap_completed(0, &lap(70_000, 2), 0, 10_000, false));
        assert_eq!(*state.result(0).unwrap(), EntryCarResult::default());

        state.end_time = 900_000;
        assert!(!state.on_lap_completed(0, &lap(70_000, 1), 0, 910_000, false));
        let result = state.result(0).unwrap();
        assert!(result.has_completed_last_lap);
        assert_eq!(result.num_laps, 0);
    }

    #[test]
    fn cut_lap_counts_in_race() {
        let mut state = race(10, 0);
        assert!(state.on_lap_completed(0, &lap(70_000, 3), 0, 70_000, false));
        assert_eq!(state.result(0).unwrap().num_laps, 1);
    }

    #[test]
    fn non_race_first_finisher_after_expiry_sets_end_time() {
        let mut state = SessionState::new(SessionConfig::qualifying(1, 1), 1, 0, 2, vec![0, 1]);
        state.session_over_flag = true;

        state.on_lap_completed(1, &lap(65_000, 0), 0, 70_000, false);
        assert_eq!(state.end_time, 70_000);
        assert!(state.result(1).unwrap().has_completed_last_lap);

        state.on_lap_completed(0, &lap(66_000, 0), 0, 75_000, false);
        assert!(state.result(0).unwrap().has_completed_last_lap);
        assert_eq!(state.end_time, 70_000);
    }

    #[test]
    fn timed_race_leader_finishes_after_time_expires() {
        let mut state = race(0, 20);
        state.results[0].num_laps = 10;
        state.results[1].num_laps = 9;
        state.leader_lap_count = 10;
        state.session_over_flag = true;

        // Leader crosses the line after time ran out.
        state.on_lap_completed(0, &lap(100_000, 0), 0, 1_250_000, false);
        assert!(state.leader_has_completed_last_lap);
        assert!(state.result(0).unwrap().has_completed_last_lap);
        assert_eq!(state.end_time, 1_250_000);

        // Lapped car finishes on its next crossing.
        state.on_lap_completed(1, &lap(101_000, 0), 0, 1_260_000, false);
        assert!(state.result(1).unwrap().has_completed_last_lap);
        assert_eq!(state.result(1).unwrap().num_laps, 10);
    }

    #[test]
    fn lapped_car_crossing_first_does_not_end_timed_race() {
        let mut state = race(0, 20);
        state.results[0].num_laps = 10;
        state.results[1].num_laps = 9;
        state.leader_lap_count = 10;
        state.session_over_flag = true;

        // P2, a lap down, crosses before the leader.
        state.on_lap_completed(1, &lap(101_000, 0), 0, 1_230_000, false);
        assert!(!state.leader_has_completed_last_lap);
        assert!(!state.result(1).unwrap().has_completed_last_lap);
        assert_eq!(state.end_time, 0);

        state.on_lap_completed(0, &lap(100_000, 0), 0, 1_250_000, false);
        assert!(state.leader_has_completed_last_lap);
        assert!(state.result(0).unwrap().has_completed_last_lap);
        assert_eq!(state.end_time, 1_250_000);

        state.on_lap_completed(1, &lap(101_000, 0), 0, 1_330_000, false);
        assert!(state.result(1).unwrap().has_completed_last_lap);
        assert_eq!(state.result(1).unwrap().num_laps, 11);
    }

    #[test]
    fn lapped_car_does_not_set_the_extra_lap_target() {
        let mut state = race(0, 20);
        state.results[0].num_laps = 10;
        state.results[1].num_laps = 9;
        state.leader_lap_count = 10;
        state.session_over_flag = true;

        state.on_lap_completed(1, &lap(101_000, 0), 0, 1_230_000, true);
        assert_eq!(state.target_lap, 0);
        assert!(!state.result(1).unwrap().has_completed_last_lap);

        state.on_lap_completed(0, &lap(100_000, 0), 0, 1_250_000, true);
        assert_eq!(state.target_lap, 12);
        assert_eq!(state.end_time, 0);
    }

    #[test]
    fn timed_race_with_extra_lap_defers_completion() {
        let mut state = race(0, 20);
        state.results[0].num_laps = 10;
        state.leader_lap_count = 10;
        state.session_over_flag = true;

        state.on_lap_completed(0, &lap(100_000, 0), 0, 1_250_000, true);
        assert_eq!(state.target_lap, 12);
        assert!(!state.result(0).unwrap().has_completed_last_lap);
        assert_eq!(state.end_time, 0);

        state.on_lap_completed(0, &lap(100_000, 0), 0, 1_350_000, true);
        assert!(state.result(0).unwrap().has_completed_last_lap);
        assert!(state.leader_has_completed_last_lap);
        assert_eq!(state.end_time, 1_350_000);
    }

    #[test]
    fn race_standings_order_by_laps_then_time() {
        let mut state = race(10, 0);
        state.results[0] = EntryCarResult {
            num_laps: 3,
            total_time: 300_000,
            ..Default::default()
        };
        state.results[1] = EntryCarResult {
            num_laps: 4,
            total_time: 390_000,
            ..Default::default()
        };
        state.results[2] = EntryCarResult {
            num_laps: 4,
            total_time: 380_000,
            ..Default::default()
        };

        let order: Vec<SlotId> = state.standings().iter().map(|row| row.slot_id).collect();
        assert_eq!(order, vec![2, 1, 0, 3]);
    }

    #[test]
    fn non_race_session_ends_after_its_time() {
        let manager = SessionManager::new(
            vec![SessionConfig::practice(0, 10), SessionConfig::race(1, 5, 0)],
            2,
            60_000,
            false,
            0,
        );
        assert!(!manager.update(599_999));
        assert!(!manager.update(600_000));
        assert!(manager.update(600_001));

        let next = manager.next_session(600_001);
        assert_eq!(next.session_type, SessionType::Race);
        manager.with_current(|state| {
            assert_eq!(state.start_ms, 600_001);
            assert_eq!(state.results().len(), 2);
        });
    }

    #[test]
    fn infinite_sessions_never_time_out() {
        let mut practice = SessionConfig::practice(0, 1);
        practice.infinite = true;
        let manager = SessionManager::new(vec![practice], 1, 0, false, 0);
        assert!(!manager.update(10_000_000));
        assert_eq!(manager.with_current(|s| s.time_left_ms(10_000_000)), 60_000);
    }

    #[test]
    fn race_ends_after_race_over_time() {
        let manager = SessionManager::new(vec![SessionConfig::race(0, 1, 0)], 1, 30_000, false, 0);
        assert!(manager.on_lap_completed(0, &lap(90_000, 0), 0, 90_000));
        assert!(!manager.update(100_000));
        assert!(manager.update(120_001));
    }

    #[test]
    fn timed_race_raises_the_session_over_flag() {
        let manager = SessionManager::new(vec![SessionConfig::race(0, 0, 1)], 1, 30_000, false, 0);
        assert!(!manager.update(60_001));
        assert!(manager.with_current(|s| s.session_over_flag));
    }

    #[test]
    fn rotation_wraps_and_builds_grid_from_best_laps() {
        let manager = SessionManager::new(
            vec![SessionConfig::qualifying(0, 10), SessionConfig::race(1, 5, 0)],
            3,
            0,
            false,
            0,
        );
        manager.on_lap_completed(2, &lap(80_000, 0), 0, 100_000);
        manager.on_lap_completed(1, &lap(85_000, 0), 0, 110_000);

        manager.next_session(700_000);
        manager.with_current(|state| {
            assert_eq!(state.grid, vec![2, 1, 0]);
            assert!(state.results().iter().all(|r| r.num_laps == 0));
        });

        let wrapped = manager.next_session(800_000);
        assert_eq!(wrapped.session_type, SessionType::Qualifying);
    }

    #[test]
    fn session_update_shifts_start_time() {
        let manager = SessionManager::new(vec![SessionConfig::practice(0, 10)], 1, 0, false, 5_000);
        let update = manager.session_update(1_200, 0.97);
        assert_eq!(update.start_time, 3_800);
        assert_eq!(update.grid, vec![0]);
    }
}
