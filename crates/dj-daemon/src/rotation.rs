//! Vibe rotation policy.
//!
//! Counts genuine track transitions and, once enough tracks have played under
//! the current vibe and nobody has made a manual request recently, picks the
//! next vibe at random while avoiding the ones heard most recently.  The
//! scheduler only decides; `DjCore` issues the `setVibe` action and reports
//! back through `record_switch` / `switch_failed`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dj_proto::vibes::{RotationSettings, Vibe, VibeCatalog};
use rand::seq::SliceRandom;
use rand::RngCore;
use tracing::debug;

/// Floor for how many recent vibes are remembered and avoided.
pub const MIN_AVOID: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RotationParams {
    pub tracks_per_vibe: u32,
    /// Always at least `MIN_AVOID`.
    pub avoid_last: usize,
    pub request_storm_window: Duration,
    pub quiet_announce_window: Duration,
}

impl RotationParams {
    pub fn from_catalog(catalog: &VibeCatalog) -> Self {
        Self::new(
            &catalog.rotation,
            Duration::from_secs(catalog.quiet_announce_secs),
        )
    }

    pub fn new(settings: &RotationSettings, quiet_announce_window: Duration) -> Self {
        Self {
            tracks_per_vibe: settings.tracks_per_vibe.max(1),
            avoid_last: settings.avoid_last.max(MIN_AVOID),
            request_storm_window: Duration::from_secs(settings.request_storm_window_secs),
            quiet_announce_window,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationState {
    pub tracks_since_vibe_start: u32,
    /// Most recent first, never longer than `avoid_last`.
    pub recent_vibe_ids: VecDeque<String>,
    pub last_manual_request_at: Option<Instant>,
}

pub struct RotationScheduler {
    params: RotationParams,
    state: RotationState,
    last_track_id: Option<String>,
    switch_in_flight: bool,
    rng: Box<dyn RngCore + Send>,
}

impl RotationScheduler {
    pub fn new(params: RotationParams, rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            params,
            state: RotationState::default(),
            last_track_id: None,
            switch_in_flight: false,
            rng,
        }
    }

    pub fn params(&self) -> &RotationParams {
        &self.params
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    /// Feed the id of the track now playing.  Returns true only for a genuine
    /// change; the first track seen after startup just primes the tracker.
    pub fn observe_track(&mut self, track_id: Option<&str>) -> bool {
        let Some(id) = track_id else {
            return false;
        };
        if self.last_track_id.as_deref() == Some(id) {
            return false;
        }
        let first = self.last_track_id.is_none();
        self.last_track_id = Some(id.to_string());
        if first {
            debug!(track = id, "first track observed");
            return false;
        }
        self.state.tracks_since_vibe_start += 1;
        debug!(
            track = id,
            tracks = self.state.tracks_since_vibe_start,
            "track transition"
        );
        true
    }

    pub fn stamp_manual_request(&mut self, now: Instant) {
        self.state.last_manual_request_at = Some(now);
    }

    /// Trigger check: enough tracks, outside the storm window, nothing in
    /// flight.
    pub fn should_rotate(&self, now: Instant) -> bool {
        if self.switch_in_flight {
            return false;
        }
        if self.state.tracks_since_vibe_start < self.params.tracks_per_vibe {
            return false;
        }
        match self.state.last_manual_request_at {
            Some(at) => now.saturating_duration_since(at) >= self.params.request_storm_window,
            None => true,
        }
    }

    /// Choose the next vibe.  `None` only when the catalog is empty.
    pub fn pick_next<'a>(&mut self, catalog: &'a VibeCatalog, current_id: Option<&str>) -> Option<&'a Vibe> {
        let avoided: Vec<&str> = self
            .state
            .recent_vibe_ids
            .iter()
            .take(self.params.avoid_last)
            .map(String::as_str)
            .collect();

        let pool: Vec<&Vibe> = catalog
            .vibes
            .iter()
            .filter(|v| Some(v.id.as_str()) != current_id && !avoided.contains(&v.id.as_str()))
            .collect();

        if pool.is_empty() {
            debug!("rotation pool empty, falling back");
            return catalog
                .vibes
                .iter()
                .find(|v| Some(v.id.as_str()) != current_id)
                .or_else(|| catalog.vibes.first());
        }
        pool.choose(&mut *self.rng).copied()
    }

    pub fn begin_switch(&mut self) {
        self.switch_in_flight = true;
    }

    pub fn switch_failed(&mut self) {
        self.switch_in_flight = false;
    }

    /// A vibe switch landed: reset the counter and remember the id.
    pub fn record_switch(&mut self, vibe_id: &str) {
        self.switch_in_flight = false;
        self.state.tracks_since_vibe_start = 0;
        self.state.recent_vibe_ids.push_front(vibe_id.to_string());
        self.state.recent_vibe_ids.truncate(self.params.avoid_last);
    }

    /// Whether an automatic switch should also be announced in chat, given how
    /// long the channel has been idle.
    pub fn should_announce(&self, now: Instant, last_channel_activity: Option<Instant>) -> bool {
        match last_channel_activity {
            Some(at) => now.saturating_duration_since(at) > self.params.quiet_announce_window,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn vibe(id: &str) -> Vibe {
        Vibe {
            id: id.into(),
            name: id.to_uppercase(),
            aliases: vec![],
        }
    }

    fn catalog(ids: &[&str]) -> VibeCatalog {
        VibeCatalog {
            vibes: ids.iter().map(|id| vibe(id)).collect(),
            ..Default::default()
        }
    }

    fn params(tracks: u32, avoid: usize) -> RotationParams {
        RotationParams {
            tracks_per_vibe: tracks,
            avoid_last: avoid,
            request_storm_window: Duration::from_secs(120),
            quiet_announce_window: Duration::from_secs(120),
        }
    }

    fn scheduler(p: RotationParams) -> RotationScheduler {
        RotationScheduler::new(p, Box::new(StdRng::seed_from_u64(7)))
    }

    #[test]
    fn test_avoid_last_floor() {
        let settings = RotationSettings {
            tracks_per_vibe: 10,
            avoid_last: 1,
            request_storm_window_secs: 60,
        };
        let p = RotationParams::new(&settings, Duration::from_secs(30));
        assert_eq!(p.avoid_last, MIN_AVOID);
        assert_eq!(p.request_storm_window, Duration::from_secs(60));
    }

    #[test]
    fn test_first_track_is_not_a_transition() {
        let mut s = scheduler(params(2, 3));
        assert!(!s.observe_track(Some("a")));
        assert!(!s.observe_track(Some("a")));
        assert!(!s.observe_track(None));
        assert_eq!(s.state().tracks_since_vibe_start, 0);
        assert!(s.observe_track(Some("b")));
        assert_eq!(s.state().tracks_since_vibe_start, 1);
    }

    #[test]
    fn test_never_rotates_before_threshold() {
        let now = Instant::now();
        let mut s = scheduler(params(3, 3));
        s.observe_track(Some("t0"));
        for i in 1..3 {
            let id = format!("t{i}");
            s.observe_track(Some(id.as_str()));
            assert!(!s.should_rotate(now), "rotated after {i} tracks");
        }
        s.observe_track(Some("t3"));
        assert!(s.should_rotate(now));
    }

    #[test]
    fn test_storm_window_suppresses_rotation() {
        let start = Instant::now();
        let mut s = scheduler(params(1, 3));
        s.observe_track(Some("a"));
        s.observe_track(Some("b"));
        s.stamp_manual_request(start);

        assert!(!s.should_rotate(start + Duration::from_secs(119)));
        assert!(s.should_rotate(start + Duration::from_secs(120)));
    }

    #[test]
    fn test_in_flight_blocks_second_trigger() {
        let now = Instant::now();
        let mut s = scheduler(params(1, 3));
        s.observe_track(Some("a"));
        s.observe_track(Some("b"));
        s.begin_switch();
        assert!(!s.should_rotate(now));
        s.switch_failed();
        assert!(s.should_rotate(now));
    }

    #[test]
    fn test_recent_ids_bounded() {
        let mut s = scheduler(params(1, 3));
        for id in ["a", "b", "c", "d", "e"] {
            s.record_switch(id);
            assert!(s.state().recent_vibe_ids.len() <= 3);
        }
        let recent: Vec<&str> = s.state().recent_vibe_ids.iter().map(String::as_str).collect();
        assert_eq!(recent, vec!["e", "d", "c"]);
        assert_eq!(s.state().tracks_since_vibe_start, 0);
    }

    #[test]
    fn test_pick_avoids_current_and_recent() {
        let cat = catalog(&["a", "b", "c", "d", "e", "f"]);
        let mut s = scheduler(params(1, 3));
        s.record_switch("b");
        s.record_switch("c");
        s.record_switch("d");

        for _ in 0..200 {
            let picked = s.pick_next(&cat, Some("a")).unwrap();
            assert!(
                picked.id == "e" || picked.id == "f",
                "picked avoided vibe {}",
                picked.id
            );
        }
    }

    #[test]
    fn test_pick_is_deterministic_with_fixed_rng() {
        let cat = catalog(&["a", "b", "c", "d"]);
        let mut s = RotationScheduler::new(params(1, 3), Box::new(StepRng::new(0, 0)));
        assert_eq!(s.pick_next(&cat, Some("a")).unwrap().id, "b");
    }

    #[test]
    fn test_empty_pool_falls_back() {
        let cat = catalog(&["a", "b", "c"]);
        let mut s = scheduler(params(1, 3));
        s.record_switch("b");
        s.record_switch("c");
        // pool is empty: a is current, b and c are recent
        assert_eq!(s.pick_next(&cat, Some("a")).unwrap().id, "b");

        let single = catalog(&["only"]);
        assert_eq!(s.pick_next(&single, Some("only")).unwrap().id, "only");
        assert!(s.pick_next(&catalog(&[]), None).is_none());
    }

    #[test]
    fn test_announce_only_when_quiet() {
        let now = Instant::now();
        let s = scheduler(params(1, 3));
        assert!(s.should_announce(now, None));
        assert!(!s.should_announce(now + Duration::from_secs(60), Some(now)));
        assert!(s.should_announce(now + Duration::from_secs(121), Some(now)));
    }
}
