use crate::DataType;

/// Compensated (Kahan) running sum.
///
/// Tracks the low-order bits lost by each addition and feeds them back into
/// the next term, so the error stays near one rounding step of the final
/// sum instead of growing with the number of terms.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KahanSum {
    sum: DataType,
    correction: DataType,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, value: DataType) {
        let term = value + self.correction;
        let next = self.sum + term;
        self.correction = term - (next - self.sum);
        self.sum = next;
    }

    pub fn value(&self) -> DataType {
        self.sum
    }
}

impl Extend<DataType> for KahanSum {
    fn extend<I: IntoIterator<Item = DataType>>(&mut self, iter: I) {
        for v in iter {
            self.add(v);
        }
    }
}

impl<'a> Extend<&'a DataType> for KahanSum {
    fn extend<I: IntoIterator<Item = &'a DataType>>(&mut self, iter: I) {
        for v in iter {
            self.add(*v);
        }
    }
}

impl FromIterator<DataType> for KahanSum {
    fn from_iter<I: IntoIterator<Item = DataType>>(iter: I) -> Self {
        let mut s = KahanSum::new();
        s.extend(iter);
        s
    }
}
