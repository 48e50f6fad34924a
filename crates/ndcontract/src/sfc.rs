//! Generalized Hilbert ("gilbert") space-filling curves.
//!
//! Maps a linear task index onto a rectangle of arbitrary size such that
//! consecutive indices are neighbours. The mapping is a pure function of its
//! arguments.
//!
//! The curve follows Jakub Červený's generalized Hilbert construction.

#[inline]
fn sign(a: i64) -> i64 {
    a.signum()
}

/// Coordinates of task `idx` on a `w × h` rectangle.
///
/// The curve starts at `(0, 0)`. The orientation is chosen so that the curve
/// can run through the rectangle without a diagonal step whenever the
/// parities of `w` and `h` allow it.
///
/// # Examples
///
/// ```
/// use ndcontract::sfc::gilbert_d2xy;
///
/// assert_eq!(gilbert_d2xy(0, 4, 4), (0, 0));
/// // a single row is walked left to right
/// assert_eq!(gilbert_d2xy(3, 5, 1), (3, 0));
/// ```
pub fn gilbert_d2xy(idx: i64, w: i64, h: i64) -> (i64, i64) {
    let move_w_possible = w % 2 == 0 || h % 2 == 1;
    let move_h_possible = w % 2 == 1 || h % 2 == 0;

    if (w >= h && move_w_possible) || !move_h_possible {
        gilbert_d2xy_r(idx, (0, 0), (w, 0), (0, h))
    } else {
        gilbert_d2xy_r(idx, (0, 0), (0, h), (w, 0))
    }
}

/// Iterative descent of the recursive gilbert construction.
///
/// `a` is the major axis vector and `b` the orthogonal one of the current
/// sub-rectangle whose first cell is `origin`.
fn gilbert_d2xy_r(dst_idx: i64, origin: (i64, i64), a: (i64, i64), b: (i64, i64)) -> (i64, i64) {
    let (mut x, mut y) = origin;
    let (mut ax, mut ay) = a;
    let (mut bx, mut by) = b;
    let mut cur_idx = 0;

    loop {
        let w = (ax + ay).abs();
        let h = (bx + by).abs();

        // unit major direction
        let (dax, day) = (sign(ax), sign(ay));
        // unit orthogonal direction
        let (dbx, dby) = (sign(bx), sign(by));

        let di = dst_idx - cur_idx;

        if h == 1 {
            return (x + dax * di, y + day * di);
        }
        if w == 1 {
            return (x + dbx * di, y + dby * di);
        }

        // floor division
        let (mut ax2, mut ay2) = (ax >> 1, ay >> 1);
        let (mut bx2, mut by2) = (bx >> 1, by >> 1);

        let w2 = (ax2 + ay2).abs();
        let h2 = (bx2 + by2).abs();

        if 2 * w > 3 * h {
            if (w2 & 1) == 1 && w > 2 {
                // prefer even steps
                ax2 += dax;
                ay2 += day;
            }

            // long case: two halves along the major axis
            let nxt_idx = cur_idx + ((ax2 + ay2) * (bx + by)).abs();
            if dst_idx < nxt_idx {
                ax = ax2;
                ay = ay2;
                continue;
            }
            cur_idx = nxt_idx;
            x += ax2;
            y += ay2;
            ax -= ax2;
            ay -= ay2;
            continue;
        }

        if (h2 & 1) == 1 && h > 2 {
            // prefer even steps
            bx2 += dbx;
            by2 += dby;
        }

        // standard case: up, long horizontal, down
        let nxt_idx = cur_idx + ((bx2 + by2) * (ax2 + ay2)).abs();
        if dst_idx < nxt_idx {
            (ax, ay, bx, by) = (bx2, by2, ax2, ay2);
            continue;
        }
        cur_idx = nxt_idx;

        let nxt_idx = cur_idx + ((ax + ay) * ((bx - bx2) + (by - by2))).abs();
        if dst_idx < nxt_idx {
            x += bx2;
            y += by2;
            bx -= bx2;
            by -= by2;
            continue;
        }
        cur_idx = nxt_idx;

        x += (ax - dax) + (bx2 - dbx);
        y += (ay - day) + (by2 - dby);
        (ax, ay, bx, by) = (-bx2, -by2, -(ax - ax2), -(ay - ay2));
    }
}

/// Coordinates of task `idx` on a `w × h × d` box.
///
/// The `w × h` plane is flattened into one curve axis, which is composed with
/// the depth axis by a second curve.
pub fn gilbert_d2xyz(idx: i64, w: i64, h: i64, d: i64) -> (i64, i64, i64) {
    if d == 1 {
        let (x, y) = gilbert_d2xy(idx, w, h);
        return (x, y, 0);
    }
    let (xy, z) = gilbert_d2xy(idx, w * h, d);
    let (x, y) = gilbert_d2xy(xy, w, h);
    (x, y, z)
}

/// Boustrophedon order on a `w × h × d` box.
///
/// Every step moves exactly one coordinate by one.
pub fn serpentine_d2xyz(idx: i64, w: i64, h: i64, d: i64) -> (i64, i64, i64) {
    let plane = w * h;
    let z = idx / plane;
    let mut rem = idx % plane;
    if z % 2 == 1 {
        rem = plane - 1 - rem;
    }
    let y = rem / w;
    let mut x = rem % w;
    if y % 2 == 1 {
        x = w - 1 - x;
    }
    debug_assert!(z < d);
    (x, y, z)
}
