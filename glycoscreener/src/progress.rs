use std::ops::{Add, AddAssign};


#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub fragmentations: usize,
    pub precursors_not_found: usize,
    pub spectra_scored: usize,
    pub combinations: usize,
    pub solutions_ranked_first: usize,
    pub solutions_missing: usize,
    pub solutions_not_applicable: usize,
    pub invalid_edges: usize,
}

impl Add for ProgressRecord {
    type Output = ProgressRecord;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ProgressRecord {
    fn add_assign(&mut self, rhs: Self) {
        self.fragmentations += rhs.fragmentations;
        self.precursors_not_found += rhs.precursors_not_found;
        self.spectra_scored += rhs.spectra_scored;
        self.combinations += rhs.combinations;
        self.solutions_ranked_first += rhs.solutions_ranked_first;
        self.solutions_missing += rhs.solutions_missing;
        self.solutions_not_applicable += rhs.solutions_not_applicable;
        self.invalid_edges += rhs.invalid_edges;
    }
}

impl ProgressRecord {
    pub fn sum(self, rhs: Self) -> Self {
        self + rhs
    }
}

impl std::iter::Sum for ProgressRecord {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Self::add)
    }
}
