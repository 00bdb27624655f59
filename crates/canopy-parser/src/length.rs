use std::cmp::Ordering;
use std::ops::{Add, AddAssign, Sub};

/// A distance through a source text, measured three ways at once: in bytes,
/// in rows (newlines crossed) and in columns within the final row.
///
/// A `Length` doubles as an absolute position when measured from the start of
/// the input. Positions compare by their byte offset alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Length {
    pub bytes: u32,
    pub row: u32,
    pub column: u32,
}

impl Length {
    pub const ZERO: Length = Length {
        bytes: 0,
        row: 0,
        column: 0,
    };

    pub fn new(bytes: u32, row: u32, column: u32) -> Self {
        Self { bytes, row, column }
    }

    pub fn is_zero(self) -> bool {
        self.bytes == 0
    }
}

impl Add for Length {
    type Output = Length;

    fn add(self, rhs: Length) -> Length {
        Length {
            bytes: self.bytes + rhs.bytes,
            row: self.row + rhs.row,
            // Crossing a row boundary restarts the column count.
            column: if rhs.row == 0 {
                self.column + rhs.column
            } else {
                rhs.column
            },
        }
    }
}

impl AddAssign for Length {
    fn add_assign(&mut self, rhs: Length) {
        *self = *self + rhs;
    }
}

impl Sub for Length {
    type Output = Length;

    fn sub(self, rhs: Length) -> Length {
        Length {
            bytes: self.bytes - rhs.bytes,
            row: self.row - rhs.row,
            column: if self.row == rhs.row {
                self.column - rhs.column
            } else {
                self.column
            },
        }
    }
}

impl PartialOrd for Length {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Length {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addition_carries_rows_and_resets_columns() {
        let a = Length::new(10, 0, 10);
        let b = Length::new(5, 0, 5);
        assert_eq!(a + b, Length::new(15, 0, 15));

        let c = Length::new(12, 2, 3);
        assert_eq!(a + c, Length::new(22, 2, 3));
    }

    #[test]
    fn subtraction_inverts_addition() {
        let a = Length::new(10, 0, 10);
        let b = Length::new(12, 2, 3);
        let sum = a + b;
        assert_eq!(sum - a, b);
    }

    #[test]
    fn ordering_is_by_bytes() {
        assert!(Length::new(3, 5, 0) < Length::new(4, 0, 4));
        assert_eq!(Length::ZERO, Length::default());
    }
}
