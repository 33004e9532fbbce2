// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reducer semantics: exact sums under any schedule, and list reducers that
//! observe serial enumeration order no matter where the strands ran.

use weft::{OpAdd, OpList, Reducer, Strand};

#[test]
fn integer_sum_is_exact() {
    const N: usize = 1_000_000;
    for _ in 0..3 {
        let sum = Reducer::<u64, OpAdd>::new(0);
        weft::invoke(|s| {
            s.for_range(0..N, 512, &|_s, _i| {
                sum.with(|v| *v += 1);
            });
        });
        assert_eq!(sum.into_inner(), N as u64);
    }
}

#[test]
fn sum_starts_from_initial_value() {
    let sum = Reducer::<i64, OpAdd>::new(100);
    weft::invoke(|s| {
        s.for_range(0..1000, 16, &|_s, i| {
            sum.with(|v| *v += i as i64);
        });
    });
    assert_eq!(sum.into_inner(), 100 + 999 * 1000 / 2);
}

type Board = Vec<usize>;

fn safe(placement: &[usize], row: usize, col: usize) -> bool {
    placement.iter().enumerate().all(|(r, &c)| {
        c != col && (row - r) != col.abs_diff(c)
    })
}

fn collect_parallel(s: &Strand<'_>, n: usize, placement: &[usize], out: &Reducer<Vec<Board>, OpList>) {
    let row = placement.len();
    if row == n {
        out.with(|v| v.push(placement.to_vec()));
        return;
    }
    s.scoped(|s| {
        for col in 0..n {
            if safe(placement, row, col) {
                let mut extended = placement.to_vec();
                extended.push(col);
                s.spawn(move |s| collect_parallel(s, n, &extended, out));
            }
        }
    });
}

fn collect_serial(n: usize, placement: &mut Vec<usize>, out: &mut Vec<Board>) {
    let row = placement.len();
    if row == n {
        out.push(placement.clone());
        return;
    }
    for col in 0..n {
        if safe(placement, row, col) {
            placement.push(col);
            collect_serial(n, placement, out);
            placement.pop();
        }
    }
}

#[test]
fn list_reducer_preserves_serial_order() {
    let mut serial = Vec::new();
    collect_serial(8, &mut Vec::new(), &mut serial);
    assert_eq!(serial.len(), 92);

    for _ in 0..5 {
        let boards = Reducer::<Vec<Board>, OpList>::new(Vec::new());
        weft::invoke(|s| collect_parallel(s, 8, &[], &boards));
        let parallel = boards.into_inner();
        assert_eq!(parallel, serial);
    }
}

#[test]
fn views_merge_left_to_right_per_spawn() {
    // Three strands append their tags; the reduced list must read in spawn
    // order even though the strands run concurrently.
    let list = Reducer::<Vec<u32>, OpList>::new(vec![0]);
    weft::invoke(|s| {
        s.scoped(|s| {
            s.spawn(|_| list.with(|v| v.push(1)));
            s.spawn(|_| list.with(|v| v.push(2)));
            list.with(|v| v.push(3));
        });
    });
    assert_eq!(list.into_inner(), vec![0, 1, 2, 3]);
}

#[test]
fn reducer_outside_region_is_plain_state() {
    let sum = Reducer::<u64, OpAdd>::new(5);
    sum.with(|v| *v += 10);
    assert_eq!(sum.into_inner(), 15);
}
