/*!
Verifying device results.

```
# use clpipe::verify::Verifier;
let verification = Verifier::compare(&[8, 125, 729], &[8, 125, 728]).unwrap();
assert_eq!(verification.to_string(), "2/3");
assert_eq!(verification.mismatches().collect::<Vec<_>>(), [2]);
```
*/

use crate::{error::Error, result::Result};
use std::fmt::{self, Display};

/// Compares device output against a host reference.
#[derive(Clone, Copy, Debug, Default)]
pub struct Verifier;

impl Verifier {
    /** Compares `reference` and `observed` element-wise, exactly.

    **errors**
    - [`LengthMismatch`](Error::LengthMismatch) if the lengths differ. */
    pub fn compare<T: PartialEq>(reference: &[T], observed: &[T]) -> Result<Verification> {
        if reference.len() != observed.len() {
            return Err(Error::LengthMismatch {
                reference: reference.len(),
                observed: observed.len(),
            });
        }
        let matches = reference
            .iter()
            .zip(observed)
            .map(|(reference, observed)| reference == observed)
            .collect();
        Ok(Verification { matches })
    }
}

/// The result of [`Verifier::compare`].
///
/// Displays as `match_count/total`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Verification {
    matches: Vec<bool>,
}

impl Verification {
    /// Whether each element matched.
    pub fn matches(&self) -> &[bool] {
        &self.matches
    }
    /// The number of matching elements.
    pub fn match_count(&self) -> usize {
        self.matches.iter().filter(|x| **x).count()
    }
    /// The number of elements.
    pub fn total(&self) -> usize {
        self.matches.len()
    }
    /// Whether every element matched.
    pub fn is_exact(&self) -> bool {
        self.matches.iter().all(|x| *x)
    }
    /// Indices of the elements that differ.
    pub fn mismatches(&self) -> impl Iterator<Item = usize> + '_ {
        self.matches
            .iter()
            .enumerate()
            .filter(|(_, matched)| !**matched)
            .map(|(index, _)| index)
    }
}

impl Display for Verification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.match_count(), self.total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact() {
        let verification = Verifier::compare(&[1, 2, 3], &[1, 2, 3]).unwrap();
        assert!(verification.is_exact());
        assert_eq!(verification.match_count(), 3);
        assert_eq!(verification.total(), 3);
        assert_eq!(verification.mismatches().count(), 0);
    }

    #[test]
    fn lengths_must_agree() {
        assert_eq!(
            Verifier::compare(&[1, 2], &[1]).unwrap_err(),
            Error::LengthMismatch {
                reference: 2,
                observed: 1
            }
        );
        let empty: [i32; 0] = [];
        assert_eq!(Verifier::compare(&empty, &empty).unwrap().to_string(), "0/0");
    }
}
