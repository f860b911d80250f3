//! Collection diffing.
//!
//! Translates a full collection snapshot into the minimal sequence of
//! remove and add events that turns the cached collection into the new
//! one, via a longest-common-subsequence computation. Used by the
//! reset path after a bus reconnect.

use crate::event::{EventKind, ResourceEvent};
use res_protocol::{encode_add_event, encode_remove_event, Value};

/// Compute the edit script from `a` to `b` as resource events.
///
/// All removes come first, in backtrack order, followed by the adds.
/// Each event's index addresses the sequence as mutated by the events
/// before it, so the script can be fed through the ordinary event
/// application path one event at a time.
pub(crate) fn diff_events(a: &[Value], b: &[Value]) -> Vec<ResourceEvent> {
    let mut s = 0;
    let mut m = a.len();
    let mut n = b.len();

    // Trim matching prefix and suffix.
    while s < m && s < n && a[s] == b[s] {
        s += 1;
    }
    if s == m && s == n {
        return Vec::new();
    }
    while s < m && s < n && a[m - 1] == b[n - 1] {
        m -= 1;
        n -= 1;
    }

    let aa = &a[s..m];
    let bb = &b[s..n];
    let m = aa.len();
    let n = bb.len();

    // LCS length matrix, column-major: c[i + w*j] is the LCS length of
    // aa[0..i) and bb[0..j).
    let w = m + 1;
    let mut c = vec![0usize; w * (n + 1)];
    for i in 0..m {
        for j in 0..n {
            c[(i + 1) + w * (j + 1)] = if aa[i] == bb[j] {
                c[i + w * j] + 1
            } else {
                c[(i + 1) + w * j].max(c[i + w * (j + 1)])
            };
        }
    }

    let lcs_len = c[w * (n + 1) - 1];
    let mut steps = Vec::with_capacity(m + n - 2 * lcs_len);

    // Backtrack from (m, n). Removes are emitted as encountered; adds
    // are collected with their position in bb, the output-relative
    // index at that point, and the removes seen so far.
    let mut idx = m + s;
    let mut i = m;
    let mut j = n;
    let mut removed = 0;
    let mut adds: Vec<(usize, usize, usize)> = Vec::new();
    loop {
        if i > 0 && j > 0 && aa[i - 1] == bb[j - 1] {
            idx -= 1;
            i -= 1;
            j -= 1;
        } else if j > 0 && (i == 0 || c[i + w * (j - 1)] >= c[(i - 1) + w * j]) {
            adds.push((j - 1, idx, removed));
            j -= 1;
        } else if i > 0 {
            idx -= 1;
            steps.push(ResourceEvent::new(
                EventKind::Remove,
                encode_remove_event(idx as i64),
            ));
            removed += 1;
            i -= 1;
        } else {
            break;
        }
    }

    // Emit the adds in reverse collection order, with indexes shifted
    // to address the post-remove sequence.
    if !adds.is_empty() {
        let last = adds.len() - 1;
        for (pos, &(bpos, at, removed_at)) in adds.iter().enumerate().rev() {
            let add_idx = at + removed_at + (last - pos) - removed;
            steps.push(ResourceEvent::new(
                EventKind::Add,
                encode_add_event(add_idx as i64, &bb[bpos]),
            ));
        }
    }

    steps
}
