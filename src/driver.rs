//! Script playback driver: consumes the playback clock and the loaded
//! script, and turns action pairs into paced device commands.
//!
//! The driver is single-threaded (the clock owner calls `tick`) and all
//! cross-thread traffic goes through the scheduler. During forward playback
//! the cursor only moves forward; a clock that jumps ahead (stutter, dropped
//! frames) skips the overrun actions instead of replaying them. Seeks are
//! the explicit exception: the cursor is repositioned by binary search, and
//! none of the skipped actions are dispatched.

use crate::predictor::{smooth_speed, SpeedPredictor};
use crate::scheduler::CommandScheduler;
use crate::types::{DeviceCommand, DeviceLimits, PlaybackState, ScriptAction};
use log::{debug, info, trace};

pub struct PlaybackDriver {
    actions: Vec<ScriptAction>,
    cursor: usize,
    state: PlaybackState,
    predictor: SpeedPredictor,
    limits: DeviceLimits,
    scheduler: CommandScheduler,
    /// Opt-in asymmetric speed smoothing (see `predictor::smooth_speed`).
    smoothing: bool,
    last_speed: u8,
    /// Cursor position of the most recent dispatch, so a tick landing on the
    /// same action twice (e.g. seek to the exact spot just played) does not
    /// duplicate the command.
    last_dispatched: Option<usize>,
}

impl PlaybackDriver {
    pub fn new(
        actions: Vec<ScriptAction>,
        predictor: SpeedPredictor,
        limits: DeviceLimits,
        scheduler: CommandScheduler,
    ) -> Self {
        debug_assert!(
            actions.windows(2).all(|w| w[0].at_ms <= w[1].at_ms),
            "script actions must be ordered by timestamp"
        );
        Self {
            actions,
            cursor: 0,
            state: PlaybackState::Stopped,
            predictor,
            limits,
            scheduler,
            smoothing: false,
            last_speed: 0,
            last_dispatched: None,
        }
    }

    pub fn with_smoothing(mut self, enabled: bool) -> Self {
        self.smoothing = enabled;
        self
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    /// True once playback time has passed the final action.
    pub fn at_end(&self) -> bool {
        !self.actions.is_empty()
            && self.cursor + 1 >= self.actions.len()
            && self.last_dispatched == Some(self.cursor)
    }

    pub fn play(&mut self) {
        if self.state != PlaybackState::Playing {
            info!("Playback started ({} actions)", self.actions.len());
            self.state = PlaybackState::Playing;
        }
    }

    /// Stop issuing commands, keeping the cursor where it is. The caller
    /// decides whether the device protocol needs an idle notification.
    pub fn pause(&mut self) {
        if self.state == PlaybackState::Playing {
            info!("Playback paused at action {}", self.cursor);
            self.state = PlaybackState::Stopped;
        }
    }

    /// Full stop: back to the top of the script.
    pub fn stop(&mut self) {
        info!("Playback stopped");
        self.state = PlaybackState::Stopped;
        self.cursor = 0;
        self.last_dispatched = None;
    }

    /// Scheduling opportunity: called on every playback clock tick.
    ///
    /// Converges the cursor onto the last action whose timestamp is at or
    /// before `now_ms`, dispatches the command for the (current, next) pair,
    /// then arms the cursor on the next action.
    pub fn tick(&mut self, now_ms: u64) {
        if self.state != PlaybackState::Playing || self.actions.is_empty() {
            return;
        }

        // Skip every action the clock has already passed; never backward.
        while self.cursor + 1 < self.actions.len()
            && self.actions[self.cursor + 1].at_ms <= now_ms
        {
            self.cursor += 1;
        }

        let current = self.actions[self.cursor];
        if current.at_ms > now_ms {
            return; // not yet due
        }
        if self.last_dispatched == Some(self.cursor) {
            return; // already handled this action
        }

        if let Some(next) = self.actions.get(self.cursor + 1).copied() {
            self.dispatch_pair(current, next);
            self.last_dispatched = Some(self.cursor);
            self.cursor += 1;
        } else {
            // Final action reached; nothing left to aim for.
            debug!("Script exhausted at {}ms", current.at_ms);
            self.last_dispatched = Some(self.cursor);
        }
    }

    /// Jump to an arbitrary position on the media timeline without replaying
    /// the skipped actions.
    pub fn seek(&mut self, target_ms: u64) {
        let was = self.state;
        self.state = PlaybackState::Seeking;
        self.cursor = Self::index_at(&self.actions, target_ms);
        self.last_dispatched = None;
        debug!("Seek to {}ms → cursor {}", target_ms, self.cursor);
        self.state = was;
    }

    /// Swap in a new script mid-session. The cursor resumes at the action
    /// matching the current playback position, not at zero.
    pub fn load_script(&mut self, actions: Vec<ScriptAction>, now_ms: u64) {
        debug_assert!(
            actions.windows(2).all(|w| w[0].at_ms <= w[1].at_ms),
            "script actions must be ordered by timestamp"
        );
        info!("Script replaced: {} actions", actions.len());
        self.actions = actions;
        self.cursor = Self::index_at(&self.actions, now_ms);
        self.last_dispatched = None;
    }

    /// Index of the last action at or before `target_ms` (0 when the target
    /// precedes the whole script). Binary search; a seek never replays the
    /// actions it jumps over.
    fn index_at(actions: &[ScriptAction], target_ms: u64) -> usize {
        let first_after = actions.partition_point(|a| a.at_ms <= target_ms);
        first_after.saturating_sub(1)
    }

    fn dispatch_pair(&mut self, current: ScriptAction, next: ScriptAction) {
        let dt_ms = next.at_ms - current.at_ms;
        if dt_ms == 0 {
            // Tied timestamps carry no time window to move in; the follow-up
            // tick converges past them.
            trace!("Skipping zero-width action pair at {}ms", current.at_ms);
            return;
        }
        let delta = current.pos.abs_diff(next.pos);
        let raw = self.predictor.predict(dt_ms as f64 / 1000.0, delta);
        let speed = if self.smoothing {
            smooth_speed(self.last_speed, raw)
        } else {
            raw
        };
        let speed = self.limits.clamp_speed(speed);
        self.last_speed = speed;

        let cmd = DeviceCommand::new(next.pos, speed);
        trace!(
            "Dispatch [{} → {}] {}",
            current,
            next,
            cmd
        );
        // Anything still queued is aimed at an older target; supersede it.
        self.scheduler.replace_existing(cmd, |_| true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Duration;

    fn action(at_ms: u64, pos: u8) -> ScriptAction {
        ScriptAction { at_ms, pos }
    }

    /// Driver plus a started scheduler whose dispatches land on `rx`.
    fn driver_with_sink(actions: Vec<ScriptAction>) -> (PlaybackDriver, Receiver<DeviceCommand>) {
        let sched = CommandScheduler::new(Duration::ZERO);
        let (tx, rx) = unbounded();
        sched.start(tx);
        let driver = PlaybackDriver::new(
            actions,
            SpeedPredictor::default(),
            DeviceLimits::default(),
            sched,
        );
        (driver, rx)
    }

    fn drain(rx: &Receiver<DeviceCommand>) -> Vec<DeviceCommand> {
        let mut got = Vec::new();
        while let Ok(cmd) = rx.recv_timeout(Duration::from_millis(100)) {
            got.push(cmd);
            if rx.is_empty() {
                break;
            }
        }
        got
    }

    fn one_second_grid() -> Vec<ScriptAction> {
        vec![
            action(0, 0),
            action(1000, 99),
            action(2000, 0),
            action(3000, 99),
        ]
    }

    #[test]
    fn test_cursor_monotonic_through_playback() {
        let (mut driver, _rx) = driver_with_sink(one_second_grid());
        driver.play();
        let mut prev_cursor = 0;
        for now in (0..=3500).step_by(100) {
            driver.tick(now);
            assert!(driver.cursor() >= prev_cursor, "cursor moved backward");
            prev_cursor = driver.cursor();
        }
        assert_eq!(driver.cursor(), 3);
        assert!(driver.at_end());
    }

    #[test]
    fn test_commands_target_next_position() {
        let (mut driver, rx) = driver_with_sink(one_second_grid());
        driver.play();
        driver.tick(0);
        std::thread::sleep(Duration::from_millis(30));
        driver.tick(1000);
        std::thread::sleep(Duration::from_millis(30));
        driver.tick(2000);
        std::thread::sleep(Duration::from_millis(50));
        let positions: Vec<u8> = drain(&rx).iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![99, 0, 99]);
    }

    #[test]
    fn test_clock_jump_skips_intermediate_actions() {
        let (mut driver, rx) = driver_with_sink(one_second_grid());
        driver.play();
        // Clock starts well past actions 0..=2.
        driver.tick(2500);
        std::thread::sleep(Duration::from_millis(50));
        let cmds = drain(&rx);
        assert_eq!(cmds.len(), 1, "one converged command, not a replay");
        assert_eq!(cmds[0].position, 99); // pair (2, 3)
        assert_eq!(driver.cursor(), 3);
    }

    #[test]
    fn test_seek_lands_without_replaying() {
        let (mut driver, rx) = driver_with_sink(one_second_grid());
        driver.play();
        driver.seek(1500);
        assert_eq!(driver.cursor(), 1, "last action at or before 1.5s");
        // No dispatch happened from the seek itself.
        std::thread::sleep(Duration::from_millis(30));
        assert!(rx.is_empty());
        // The next tick resumes from the seek target's pair (1, 2).
        driver.tick(1500);
        std::thread::sleep(Duration::from_millis(50));
        let cmds = drain(&rx);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].position, 0);
    }

    #[test]
    fn test_seek_before_first_action() {
        let (mut driver, _rx) = driver_with_sink(vec![action(500, 10), action(1000, 90)]);
        driver.play();
        driver.seek(100);
        assert_eq!(driver.cursor(), 0);
        driver.tick(100); // nothing due yet
        assert_eq!(driver.cursor(), 0);
    }

    #[test]
    fn test_example_midpoint_prediction() {
        // Script [(0,0),(500,99),(1000,0)] at 750ms: cursor on action 1,
        // command targets position 0 with speed from dt=0.5s, dpos=99.
        let (mut driver, rx) = driver_with_sink(vec![
            action(0, 0),
            action(500, 99),
            action(1000, 0),
        ]);
        driver.play();
        driver.seek(750);
        assert_eq!(driver.cursor(), 1);
        driver.tick(750);
        std::thread::sleep(Duration::from_millis(50));
        let cmds = drain(&rx);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].position, 0);
        let expected = DeviceLimits::default()
            .clamp_speed(SpeedPredictor::default().predict(0.5, 99));
        assert_eq!(cmds[0].speed, expected);
    }

    #[test]
    fn test_pause_stops_dispatch_and_keeps_cursor() {
        let (mut driver, rx) = driver_with_sink(one_second_grid());
        driver.play();
        driver.tick(0);
        driver.pause();
        let cursor = driver.cursor();
        driver.tick(2500);
        assert_eq!(driver.cursor(), cursor, "paused driver must not advance");
        driver.play();
        driver.tick(2500);
        assert!(driver.cursor() > cursor);
        drop(rx);
    }

    #[test]
    fn test_stop_resets_cursor() {
        let (mut driver, _rx) = driver_with_sink(one_second_grid());
        driver.play();
        driver.tick(2500);
        driver.stop();
        assert_eq!(driver.cursor(), 0);
        assert_eq!(driver.state(), PlaybackState::Stopped);
    }

    #[test]
    fn test_reload_resumes_at_current_position() {
        let (mut driver, _rx) = driver_with_sink(one_second_grid());
        driver.play();
        driver.tick(2100);
        let replacement = vec![action(0, 5), action(1900, 50), action(4000, 95)];
        driver.load_script(replacement, 2100);
        assert_eq!(driver.cursor(), 1, "resume at the action matching 2.1s");
    }

    #[test]
    fn test_tied_timestamps_do_not_reach_predictor() {
        // A zero-width pair must be skipped, not divided by.
        let (mut driver, rx) = driver_with_sink(vec![
            action(0, 0),
            action(500, 99),
            action(500, 10),
            action(1000, 0),
        ]);
        driver.play();
        driver.tick(0);
        std::thread::sleep(Duration::from_millis(30));
        driver.tick(600); // past the tie: converges to index 2
        std::thread::sleep(Duration::from_millis(50));
        let cmds = drain(&rx);
        // First command targets 99; second pairs (2 → 3) targeting 0.
        assert_eq!(cmds.last().unwrap().position, 0);
        assert_eq!(driver.cursor(), 3);
    }

    #[test]
    fn test_speed_clamped_to_device_limits() {
        // 50ms window over the full range wants speed 99; limits cap at 95.
        let (mut driver, rx) = driver_with_sink(vec![action(0, 0), action(50, 99)]);
        driver.play();
        driver.tick(0);
        std::thread::sleep(Duration::from_millis(50));
        let cmds = drain(&rx);
        assert_eq!(cmds[0].speed, DeviceLimits::default().max_speed);
    }

    #[test]
    fn test_empty_script_is_inert() {
        let (mut driver, rx) = driver_with_sink(Vec::new());
        driver.play();
        driver.tick(1000);
        assert!(rx.is_empty());
        assert!(!driver.at_end());
    }
}
