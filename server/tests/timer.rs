// Copyright 2024 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Timer fan-out, cancellation and repetition on a running loop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rill::EventLoop;

fn counter() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let c = Arc::new(AtomicUsize::new(0));
    (c.clone(), c)
}

#[test]
fn repeating_and_one_shot_timers_fire_as_scheduled() {
    let loop_ = EventLoop::new().expect("event loop");

    let (every, every_out) = counter();
    loop_.run_every(Duration::from_millis(100), move || {
        every.fetch_add(1, Ordering::SeqCst);
    });

    let mut one_shot_outs = Vec::new();
    for delay_ms in [100u64, 150, 250] {
        let (shot, shot_out) = counter();
        loop_.run_after(Duration::from_millis(delay_ms), move || {
            shot.fetch_add(1, Ordering::SeqCst);
        });
        one_shot_outs.push(shot_out);
    }

    let quit_handle = loop_.clone();
    loop_.run_after(Duration::from_millis(380), move || {
        quit_handle.quit();
    });
    loop_.run();

    assert!(
        every_out.load(Ordering::SeqCst) >= 2,
        "repeating timer fired {} times",
        every_out.load(Ordering::SeqCst)
    );
    for shot in &one_shot_outs {
        assert_eq!(1, shot.load(Ordering::SeqCst));
    }
}

#[test]
fn cancelled_timer_never_fires() {
    let loop_ = EventLoop::new().expect("event loop");

    let (fired, fired_out) = counter();
    let id = loop_.run_after(Duration::from_millis(100), move || {
        fired.fetch_add(1, Ordering::SeqCst);
    });
    loop_.cancel(id);

    let quit_handle = loop_.clone();
    loop_.run_after(Duration::from_millis(250), move || {
        quit_handle.quit();
    });
    loop_.run();

    assert_eq!(0, fired_out.load(Ordering::SeqCst));
}

#[test]
fn repeating_timer_cancelled_while_firing_does_not_rearm() {
    let loop_ = EventLoop::new().expect("event loop");

    let (fired, fired_out) = counter();
    let id_slot: Arc<Mutex<Option<rill::TimerId>>> = Arc::new(Mutex::new(None));

    let cancel_handle = loop_.clone();
    let slot = id_slot.clone();
    let id = loop_.run_every(Duration::from_millis(50), move || {
        fired.fetch_add(1, Ordering::SeqCst);
        // Cancel ourselves from inside the callback.
        if let Some(id) = *slot.lock().unwrap() {
            cancel_handle.cancel(id);
        }
    });
    *id_slot.lock().unwrap() = Some(id);

    let quit_handle = loop_.clone();
    loop_.run_after(Duration::from_millis(300), move || {
        quit_handle.quit();
    });
    loop_.run();

    assert_eq!(1, fired_out.load(Ordering::SeqCst));
}

#[test]
fn zero_interval_run_every_is_one_shot() {
    let loop_ = EventLoop::new().expect("event loop");

    let (fired, fired_out) = counter();
    loop_.run_every(Duration::ZERO, move || {
        fired.fetch_add(1, Ordering::SeqCst);
    });

    let quit_handle = loop_.clone();
    loop_.run_after(Duration::from_millis(200), move || {
        quit_handle.quit();
    });
    loop_.run();

    assert_eq!(1, fired_out.load(Ordering::SeqCst));
}

#[test]
fn timers_fire_in_expiration_order() {
    let loop_ = EventLoop::new().expect("event loop");

    let order = Arc::new(Mutex::new(Vec::new()));
    for (label, delay_ms) in [("c", 150u64), ("a", 50), ("b", 100)] {
        let order = order.clone();
        loop_.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(label);
        });
    }

    let quit_handle = loop_.clone();
    loop_.run_after(Duration::from_millis(250), move || {
        quit_handle.quit();
    });
    loop_.run();

    assert_eq!(vec!["a", "b", "c"], *order.lock().unwrap());
}
