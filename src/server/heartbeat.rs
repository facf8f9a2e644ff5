//! Conclave server heartbeats management module implementation.

use std::collections::HashMap;

use crate::server::MemberId;
use crate::utils::{Bitmap, ConclaveError, Timer};

use rand::prelude::*;

use tokio::time::{self, Duration, Interval, MissedTickBehavior};

/// Multiplexed heartbeat timeout events type.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum HeartbeatEvent {
    /// Leader inactivity timeout.
    HearTimeout,

    /// Sending interval tick.
    SendTicked,
}

/// The heartbeats management module. Tracks an approximate liveness view of
/// peers; this view is what the leader consults as its active ack-eligible
/// set.
pub(crate) struct Heartbeater {
    /// My member ID.
    _me: MemberId,

    /// Total number of members in the ensemble.
    _population: u8,

    /// Timer for hearing heartbeat from the leader.
    hear_timer: Timer,

    /// Minimum hearing timeout interval.
    hear_timeout_min: Duration,

    /// Maximum hearing timeout interval.
    hear_timeout_max: Duration,

    /// Interval for sending heartbeats to peers.
    send_interval: Interval,

    /// True if sending ticks are enabled; false otherwise.
    is_sending: bool,

    /// Heartbeat reply counters for approximate detection of peer health.
    /// Tuple of (#hb_replied, #hb_replied seen at last send, repetition).
    reply_cnts: HashMap<MemberId, (u64, u64, u8)>,

    /// Approximate health status tracking of peer members.
    peer_alive: Bitmap,
}

impl Heartbeater {
    /// Creates a new heartbeats manager.
    pub(crate) fn new_and_setup(
        me: MemberId,
        population: u8,
        hear_timeout_min: Duration,
        hear_timeout_max: Duration,
        send_interval: Duration,
    ) -> Result<Heartbeater, ConclaveError> {
        if hear_timeout_min < Duration::from_millis(100) {
            return logged_err!(
                "invalid heartbeat min hear_timeout {:?}",
                hear_timeout_min
            );
        }
        if hear_timeout_max < hear_timeout_min + Duration::from_millis(100) {
            return logged_err!(
                "heartbeat max hear_timeout {:?} must be >= 100ms + min hear_timeout {:?}",
                hear_timeout_max, hear_timeout_min
            );
        }
        if send_interval < Duration::from_millis(1)
            || send_interval > hear_timeout_max
        {
            return logged_err!(
                "invalid heartbeat send_interval {:?}",
                send_interval
            );
        }

        let mut send_interval = time::interval(send_interval);
        send_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reply_cnts = (0..population)
            .filter_map(|p| if p == me { None } else { Some((p, (1, 0, 0))) })
            .collect();

        Ok(Heartbeater {
            _me: me,
            _population: population,
            hear_timer: Timer::default(),
            hear_timeout_min,
            hear_timeout_max,
            send_interval,
            is_sending: false,
            reply_cnts,
            peer_alive: Bitmap::new(population, true),
        })
    }

    /// Sets the sending flag.
    pub(crate) fn set_sending(&mut self, sending: bool) {
        self.is_sending = sending;
    }

    /// Waits for a heartbeat-related timeout event.
    pub(crate) async fn get_event(&mut self) -> HeartbeatEvent {
        tokio::select! {
            _ = self.hear_timer.timeout() => HeartbeatEvent::HearTimeout,
            _ = self.send_interval.tick(), if self.is_sending => HeartbeatEvent::SendTicked,
        }
    }

    /// Chooses a random timeout from the min-max range and kicks off the
    /// heartbeat hearing timer.
    pub(crate) fn kickoff_hear_timer(&mut self) -> Result<(), ConclaveError> {
        self.hear_timer.cancel()?;

        let timeout_ms = thread_rng().gen_range(
            self.hear_timeout_min.as_millis()
                ..=self.hear_timeout_max.as_millis(),
        );
        self.hear_timer
            .kickoff(Duration::from_millis(timeout_ms as u64))
    }

    /// Stops the hearing timer (e.g., while I am the leader myself).
    pub(crate) fn cancel_hear_timer(&mut self) -> Result<(), ConclaveError> {
        self.hear_timer.cancel()
    }

    /// Gets the speculated liveness status of peers.
    pub(crate) fn peer_alive(&self) -> &Bitmap {
        &self.peer_alive
    }

    /// Clears peers' heartbeat reply counter statistics.
    pub(crate) fn clear_reply_cnts(&mut self) {
        for cnts in self.reply_cnts.values_mut() {
            *cnts = (1, 0, 0);
        }
    }

    /// Called upon each broadcast, updates peers' max heartbeat reply
    /// counters and their repetitions seen, and checks if we should
    /// speculate that a peer is down. Returns true if any peer death got
    /// speculated, false otherwise.
    pub(crate) fn update_bcast_cnts(&mut self) -> Result<bool, ConclaveError> {
        let mut peer_death = false;

        for (&peer, cnts) in self.reply_cnts.iter_mut() {
            if cnts.0 > cnts.1 {
                // more hb replies have been received from this peer; it is
                // probably alive
                cnts.1 = cnts.0;
                cnts.2 = 0;
            } else {
                // did not receive hb reply from this peer at least for the
                // last sent hb from me; increment repetition count
                cnts.2 += 1;
                let repeat_threshold = (self.hear_timeout_min.as_millis()
                    / self.send_interval.period().as_millis())
                    as u8;

                if cnts.2 > repeat_threshold {
                    // did not receive hb reply from this peer for too many
                    // past hbs sent from me; this peer is probably dead
                    if self.peer_alive.get(peer)? {
                        self.peer_alive.set(peer, false)?;
                        pf_info!("peer_alive updated: {:?}", self.peer_alive);
                        peer_death = true;
                    }
                    cnts.2 = 0;
                }
            }
        }

        Ok(peer_death)
    }

    /// Called upon each hearing, updates a peer's heard heartbeat counter,
    /// and checks if we should speculate that the peer is back up.
    pub(crate) fn update_heard_cnt(
        &mut self,
        peer: MemberId,
    ) -> Result<(), ConclaveError> {
        if let Some(cnts) = self.reply_cnts.get_mut(&peer) {
            cnts.0 += 1;

            if !self.peer_alive.get(peer)? {
                self.peer_alive.set(peer, true)?;
                pf_info!("peer_alive updated: {:?}", self.peer_alive);
            }

            Ok(())
        } else {
            logged_err!("peer {} not found in reply_cnts", peer)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn heartbeater_setup() -> Result<(), ConclaveError> {
        assert!(Heartbeater::new_and_setup(
            0,
            3,
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(1),
        )
        .is_err());
        let hb = Heartbeater::new_and_setup(
            0,
            3,
            Duration::from_millis(300),
            Duration::from_millis(600),
            Duration::from_millis(20),
        )?;
        assert_eq!(hb.peer_alive().count(), 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn speculate_death_and_revival() -> Result<(), ConclaveError> {
        let mut hb = Heartbeater::new_and_setup(
            0,
            3,
            Duration::from_millis(300),
            Duration::from_millis(600),
            Duration::from_millis(100),
        )?;
        // peer 1 replies, peer 2 stays silent past the repeat threshold
        let rounds = 300 / 100 + 2;
        for _ in 0..rounds {
            hb.update_heard_cnt(1)?;
            hb.update_bcast_cnts()?;
        }
        assert!(hb.peer_alive().get(1)?);
        assert!(!hb.peer_alive().get(2)?);
        // peer 2 comes back
        hb.update_heard_cnt(2)?;
        assert!(hb.peer_alive().get(2)?);
        Ok(())
    }
}
