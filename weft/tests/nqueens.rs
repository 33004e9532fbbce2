// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The n-queens search tree: irregular parallelism with a spawn per viable
//! board extension.

use weft::Strand;

fn safe(placement: &[usize], row: usize, col: usize) -> bool {
    placement.iter().enumerate().all(|(r, &c)| {
        c != col && (row - r) != col.abs_diff(c)
    })
}

fn nqueens(s: &Strand<'_>, n: usize, placement: &[usize]) -> usize {
    let row = placement.len();
    if row == n {
        return 1;
    }
    let mut counts = vec![0_usize; n];
    s.scoped(|s| {
        for (col, slot) in counts.iter_mut().enumerate() {
            if safe(placement, row, col) {
                let mut extended = Vec::with_capacity(row + 1);
                extended.extend_from_slice(placement);
                extended.push(col);
                s.spawn(move |s| *slot = nqueens(s, n, &extended));
            }
        }
    });
    counts.iter().sum()
}

#[test]
fn eight_queens_has_92_solutions() {
    assert_eq!(weft::invoke(|s| nqueens(s, 8, &[])), 92);
}

#[test]
fn ten_queens_has_724_solutions() {
    assert_eq!(weft::invoke(|s| nqueens(s, 10, &[])), 724);
}

#[test]
#[ignore = "long-running"]
fn thirteen_queens_has_73712_solutions() {
    assert_eq!(weft::invoke(|s| nqueens(s, 13, &[])), 73_712);
}
