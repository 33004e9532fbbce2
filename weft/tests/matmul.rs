// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Divide-and-conquer matrix multiply against the serial triple loop.

use weft::Strand;

struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> i64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        ((self.0 >> 33) % 17) as i64 - 8
    }
}

fn random_matrix(n: usize, seed: u64) -> Vec<i64> {
    let mut rng = Lcg(seed);
    (0..n * n).map(|_| rng.next()).collect()
}

fn serial(a: &[i64], b: &[i64], n: usize) -> Vec<i64> {
    let mut c = vec![0; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                c[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    c
}

/// A square view into a row-major matrix.
#[derive(Clone, Copy)]
struct View<'a> {
    data: &'a [i64],
    stride: usize,
    row: usize,
    col: usize,
}

impl<'a> View<'a> {
    fn at(&self, i: usize, j: usize) -> i64 {
        self.data[(self.row + i) * self.stride + self.col + j]
    }

    fn quad(&self, qi: usize, qj: usize, h: usize) -> View<'a> {
        View { row: self.row + qi * h, col: self.col + qj * h, ..*self }
    }
}

/// Multiplies two m-by-m views into an owned m-by-m result, recursing over
/// quadrants and spawning seven of the eight sub-multiplies.
fn mm_dac(s: &Strand<'_>, a: View<'_>, b: View<'_>, m: usize) -> Vec<i64> {
    const BASE: usize = 32;
    if m <= BASE {
        let mut c = vec![0; m * m];
        for i in 0..m {
            for k in 0..m {
                let aik = a.at(i, k);
                for j in 0..m {
                    c[i * m + j] += aik * b.at(k, j);
                }
            }
        }
        return c;
    }

    let h = m / 2;
    let mut parts: [Vec<i64>; 8] = Default::default();
    s.scoped(|s| {
        let mut slots = parts.iter_mut();
        for (qi, qj, term) in
            [(0, 0, 0), (0, 0, 1), (0, 1, 0), (0, 1, 1), (1, 0, 0), (1, 0, 1), (1, 1, 0)]
        {
            let slot = slots.next().unwrap();
            s.spawn(move |s| {
                *slot = mm_dac(s, a.quad(qi, 0, h).quad(0, term, h), b.quad(term, qj, h), h);
            });
        }
        let last = slots.next().unwrap();
        *last = mm_dac(s, a.quad(1, 1, h), b.quad(1, 1, h), h);
    });

    // parts[2q] + parts[2q + 1] forms quadrant q; stitch them into the
    // result.
    let mut c = vec![0; m * m];
    for (q, pair) in parts.chunks(2).enumerate() {
        let (qi, qj) = (q / 2, q % 2);
        for i in 0..h {
            for j in 0..h {
                c[(qi * h + i) * m + qj * h + j] = pair[0][i * h + j] + pair[1][i * h + j];
            }
        }
    }
    c
}

fn run(n: usize) {
    let a = random_matrix(n, 0x5eed_0001);
    let b = random_matrix(n, 0x5eed_0002);
    let expect = serial(&a, &b, n);

    let full_a = View { data: &a, stride: n, row: 0, col: 0 };
    let full_b = View { data: &b, stride: n, row: 0, col: 0 };
    let c = weft::invoke(|s| mm_dac(s, full_a, full_b, n));
    assert_eq!(c, expect);
}

#[test]
fn dac_matches_serial_128() {
    run(128);
}

#[test]
fn dac_matches_serial_256() {
    run(256);
}

#[test]
#[ignore = "long-running"]
fn dac_matches_serial_1024() {
    run(1024);
}
