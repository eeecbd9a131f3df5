//! Multi-track merge into a single playback timeline.
//!
//! Source tracks are delta-timed independently. The merge walks them in
//! lockstep and emits one flat array whose cumulative times never decrease.
//! When two tracks have an event at the same absolute time, the track with
//! the lower index goes first; events within one track keep their order.

use super::event::RawEvent;
use super::file::TrackIter;
use super::MergedEvent;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Narrows a gap between emitted events to the stream's 32-bit delta.
fn clamp_delta(gap: u64, index: usize) -> u32 {
    u32::try_from(gap).unwrap_or_else(|_| {
        tracing::warn!(
            index,
            gap,
            "gap before event exceeds the largest stream delta, song timing is shortened"
        );
        u32::MAX
    })
}

/// Merges delta-timed tracks into one absolute-time-ordered event array.
///
/// Every track is consumed to exhaustion. Events that the stream has no use
/// for are dropped but still advance their track's clock, and each emitted
/// event's delta is measured from the previous *emitted* event.
///
/// # Arguments
///
/// * `tracks` - Track cursors in file order (index order decides ties)
/// * `capacity_hint` - Expected number of events, used to size the output
///
/// # Returns
///
/// The merged events, ready to stream
pub fn merge_tracks<T: TrackIter>(mut tracks: Vec<T>, capacity_hint: usize) -> Vec<MergedEvent> {
    let mut events = Vec::with_capacity(capacity_hint);

    // Keyed by (candidate absolute time, track index): the smallest key is the
    // next event to emit, and equal times fall back to the lower index.
    let mut pending: BinaryHeap<Reverse<(u64, usize)>> = BinaryHeap::with_capacity(tracks.len());
    for (index, track) in tracks.iter_mut().enumerate() {
        if let Some(delta) = track.delta_time() {
            pending.push(Reverse((delta as u64, index)));
        }
    }

    let mut emitted_time: u64 = 0;

    while let Some(Reverse((time, index))) = pending.pop() {
        let track = &mut tracks[index];

        let Some(event) = track.next_event() else {
            continue;
        };

        if let Some(word) = RawEvent::pack(&event) {
            let delta = clamp_delta(time - emitted_time, events.len());
            events.push(MergedEvent::new(delta, word));
            emitted_time = time;
        }

        if let Some(delta) = track.delta_time() {
            pending.push(Reverse((time + delta as u64, index)));
        }
    }

    tracing::debug!(
        tracks = tracks.len(),
        events = events.len(),
        "merged MIDI tracks into a single stream"
    );

    events
}
