// Shape helpers — strides and layout predicates
//
// The fuser's internal IR assumes every tensor is laid out in the default
// contiguous (row-major) order. These helpers define what "default" means
// and classify the stride configurations the output restrider can handle.

/// Number of elements implied by a size vector.
pub fn numel(sizes: &[i64]) -> i64 {
    sizes.iter().product()
}

/// Default contiguous (row-major) strides for the given sizes.
///
/// The last dimension has stride 1, and each earlier dimension's stride is
/// the product of all later sizes. A `[2, 3]` tensor gets strides `[3, 1]`.
pub fn contiguous_strides(sizes: &[i64]) -> Vec<i64> {
    let mut strides = vec![1i64; sizes.len()];
    for i in (0..sizes.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * sizes[i + 1].max(1);
    }
    strides
}

/// Whether `strides` describe a dense, non-overlapping layout of `sizes`:
/// the element addresses cover exactly `numel` distinct positions under
/// some permutation of the dimensions.
///
/// This is the precondition for the output restrider; strided outputs that
/// are not dense (or that overlap) cannot be matched by permuting element
/// positions in a contiguous buffer.
pub fn dense_non_overlapping(sizes: &[i64], strides: &[i64]) -> bool {
    if sizes.len() != strides.len() {
        return false;
    }
    if sizes.iter().any(|&s| s == 0) {
        // Empty tensors are trivially dense.
        return true;
    }
    // Order dimensions by stride descending (stable, so equal strides keep
    // their original relative order), then require the strides to telescope
    // like contiguous strides of the permuted sizes.
    let mut order: Vec<usize> = (0..sizes.len()).collect();
    order.sort_by(|&a, &b| strides[b].cmp(&strides[a]));
    let mut expected = 1i64;
    for &idx in order.iter().rev() {
        if strides[idx] != expected {
            return false;
        }
        expected *= sizes[idx];
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_row_major() {
        assert_eq!(contiguous_strides(&[2, 3]), vec![3, 1]);
        assert_eq!(contiguous_strides(&[4, 4]), vec![4, 1]);
        assert_eq!(contiguous_strides(&[2, 16, 1024]), vec![16384, 1024, 1]);
        assert_eq!(contiguous_strides(&[]), Vec::<i64>::new());
    }

    #[test]
    fn dense_layouts() {
        // Contiguous is dense.
        assert!(dense_non_overlapping(&[2, 3], &[3, 1]));
        // Transposed is dense too, just permuted.
        assert!(dense_non_overlapping(&[2, 3], &[1, 2]));
        // Overlapping strides are not.
        assert!(!dense_non_overlapping(&[2, 3], &[1, 1]));
        // Gappy strides are not.
        assert!(!dense_non_overlapping(&[2, 3], &[6, 2]));
    }
}
