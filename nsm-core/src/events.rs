//! Ordered event queue driving simulated time.
//!
//! Periodic sources (the time discretisation, sensors, actuators) compute
//! their k-th tick as `t0 + k·h`, so long runs do not accumulate rounding
//! drift. Non-smooth events found by root detection are inserted between
//! ticks. Events closer than `tick` are merged into one.

use crate::error::{Error, Result};
use tracing::debug;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// What happens at an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum EventKind {
    TimeDiscretisation,
    NonSmooth,
    /// Sensor capture, by sensor index.
    Sensor(usize),
    /// Actuator action, by actuator index.
    Actuator(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub time: f64,
    pub kind: EventKind,
}

#[derive(Debug, Clone)]
struct Periodic {
    kind: EventKind,
    t0: f64,
    h: f64,
    k: u64,
}

impl Periodic {
    fn next_time(&self) -> f64 {
        self.t0 + (self.k + 1) as f64 * self.h
    }
}

/// Event queue with a current and a next event.
#[derive(Debug, Clone)]
pub struct EventsManager {
    t0: f64,
    t_final: f64,
    tick: f64,
    current: f64,
    sources: Vec<Periodic>,
    non_smooth: Vec<f64>,
}

impl EventsManager {
    /// Manager over `[t0, t_final]` with the main time discretisation step `h`.
    pub fn new(t0: f64, t_final: f64, h: f64) -> Result<Self> {
        if h <= 0.0 || !h.is_finite() {
            return Err(Error::InvalidConfiguration(format!("time step must be positive, got {}", h)));
        }
        if t_final <= t0 || t_final.is_nan() {
            return Err(Error::InvalidConfiguration(format!("final time {} is not after initial time {}", t_final, t0)));
        }
        Ok(Self {
            t0,
            t_final,
            tick: h * 1e-9,
            current: t0,
            sources: vec![Periodic {
                kind: EventKind::TimeDiscretisation,
                t0,
                h,
                k: 0,
            }],
            non_smooth: Vec::new(),
        })
    }

    /// Merge threshold: events closer than this are one event.
    pub fn tick(&self) -> f64 {
        self.tick
    }

    pub fn set_tick(&mut self, tick: f64) {
        self.tick = tick.abs();
    }

    /// Register a periodic sensor or actuator source with its own period.
    pub fn insert_periodic(&mut self, kind: EventKind, period: f64) -> Result<()> {
        if period <= 0.0 || !period.is_finite() {
            return Err(Error::InvalidConfiguration(format!("event period must be positive, got {}", period)));
        }
        // first tick at the next multiple of the period after the current time
        let k = ((self.current - self.t0) / period).floor().max(0.0) as u64;
        let mut source = Periodic {
            kind,
            t0: self.t0,
            h: period,
            k,
        };
        while source.next_time() <= self.current + self.tick {
            source.k += 1;
        }
        self.sources.push(source);
        Ok(())
    }

    /// Time of the current event (start of the current step).
    pub fn starting_time(&self) -> f64 {
        self.current
    }

    /// Time of the next event.
    pub fn next_time(&self) -> f64 {
        let periodic = self.sources.iter().map(Periodic::next_time).fold(f64::INFINITY, f64::min);
        let non_smooth = self.non_smooth.first().copied().unwrap_or(f64::INFINITY);
        periodic.min(non_smooth)
    }

    /// Length of the current step.
    pub fn time_step(&self) -> f64 {
        self.next_time() - self.current
    }

    pub fn final_time(&self) -> f64 {
        self.t_final
    }

    /// Main time discretisation step.
    pub fn discretisation_step(&self) -> f64 {
        self.sources[0].h
    }

    /// True while the next event lies within the simulated interval.
    pub fn has_next_event(&self) -> bool {
        self.next_time() <= self.t_final + self.tick
    }

    /// Insert a non-smooth event strictly inside (current, next].
    pub fn schedule_non_smooth_event(&mut self, time: f64) -> Result<()> {
        if time <= self.current + self.tick {
            return Err(Error::InvalidConfiguration(format!(
                "non-smooth event at t = {} does not follow the current event at t = {}",
                time, self.current
            )));
        }
        if self.non_smooth.iter().any(|t| (t - time).abs() <= self.tick) {
            return Ok(());
        }
        let pos = self.non_smooth.partition_point(|t| *t < time);
        self.non_smooth.insert(pos, time);
        debug!(time, "non-smooth event scheduled");
        Ok(())
    }

    /// Kinds of the events that coincide with the next event.
    pub fn pending_kinds(&self) -> Vec<EventKind> {
        let next = self.next_time();
        let mut kinds: Vec<EventKind> = self
            .sources
            .iter()
            .filter(|s| (s.next_time() - next).abs() <= self.tick)
            .map(|s| s.kind)
            .collect();
        if self.non_smooth.first().is_some_and(|t| (t - next).abs() <= self.tick) {
            kinds.push(EventKind::NonSmooth);
        }
        kinds.sort();
        kinds
    }

    /// Advance to the next event and return the kinds that fired there.
    pub fn process_events(&mut self) -> Vec<Event> {
        let next = self.next_time();
        let kinds = self.pending_kinds();
        for source in &mut self.sources {
            if (source.next_time() - next).abs() <= self.tick {
                source.k += 1;
            }
        }
        let tick = self.tick;
        self.non_smooth.retain(|t| (t - next).abs() > tick);
        debug_assert!(next > self.current);
        self.current = next;
        kinds.into_iter().map(|kind| Event { time: next, kind }).collect()
    }

    /// Rewind to the initial time, dropping pending non-smooth events.
    pub fn reset(&mut self) {
        self.current = self.t0;
        self.non_smooth.clear();
        for source in &mut self.sources {
            source.k = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticks_have_no_drift() {
        let mut events = EventsManager::new(0.0, 20.0, 0.1).unwrap();
        let mut steps = 0;
        while events.has_next_event() {
            events.process_events();
            steps += 1;
        }
        assert_eq!(steps, 200);
        assert_eq!(events.starting_time(), 20.0);
    }

    #[test]
    fn test_times_strictly_increase() {
        let mut events = EventsManager::new(0.0, 1.0, 0.25).unwrap();
        events.insert_periodic(EventKind::Sensor(0), 0.1).unwrap();
        let mut last = events.starting_time();
        while events.has_next_event() {
            assert!(events.starting_time() < events.next_time());
            let fired = events.process_events();
            assert!(fired[0].time > last);
            last = fired[0].time;
        }
    }

    #[test]
    fn test_non_smooth_event_inserted_between_ticks() {
        let mut events = EventsManager::new(0.0, 1.0, 0.5).unwrap();
        events.schedule_non_smooth_event(0.3).unwrap();
        assert_eq!(events.next_time(), 0.3);
        let fired = events.process_events();
        assert_eq!(fired[0].kind, EventKind::NonSmooth);
        assert_eq!(events.next_time(), 0.5);
    }

    #[test]
    fn test_coinciding_events_are_merged() {
        let mut events = EventsManager::new(0.0, 1.0, 0.5).unwrap();
        events.insert_periodic(EventKind::Actuator(0), 0.25).unwrap();
        events.process_events(); // 0.25
        let fired = events.process_events(); // 0.5: tick + actuator
        assert_eq!(fired.len(), 2);
        assert!(fired.iter().any(|e| e.kind == EventKind::TimeDiscretisation));
        assert!(fired.iter().any(|e| e.kind == EventKind::Actuator(0)));
    }

    #[test]
    fn test_event_in_the_past_is_rejected() {
        let mut events = EventsManager::new(0.0, 1.0, 0.5).unwrap();
        events.process_events();
        assert!(events.schedule_non_smooth_event(0.2).is_err());
    }

    #[test]
    fn test_invalid_step() {
        assert!(EventsManager::new(0.0, 1.0, 0.0).is_err());
        assert!(EventsManager::new(1.0, 0.0, 0.1).is_err());
    }
}
