//////////////////////
// Compressed data  //
//////////////////////

/// Layout of a `CompressedSparseData`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressedSparseFormat {
    /// Outer slices are columns
    Csc,
    /// Outer slices are rows
    Csr,
}

impl CompressedSparseFormat {
    fn flipped(self) -> Self {
        match self {
            Self::Csc => Self::Csr,
            Self::Csr => Self::Csc,
        }
    }
}

/// Structure holding compressed sparse data (CSC or CSR)
///
/// ### Fields
///
/// * `data` - The non-zero values.
/// * `indices` - The inner indices (row indices for CSC, column indices for
///   CSR).
/// * `indptr` - The outer pointers (column pointers for CSC, row pointers for
///   CSR).
/// * `cs_type` - Which of the two layouts is stored.
/// * `shape` - `(nrow, ncol)` of the matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedSparseData<T>
where
    T: Clone + Default,
{
    pub data: Vec<T>,
    pub indices: Vec<usize>,
    pub indptr: Vec<usize>,
    pub cs_type: CompressedSparseFormat,
    pub shape: (usize, usize),
}

impl<T> CompressedSparseData<T>
where
    T: Clone + Default,
{
    /// Column-compressed data, `indices` are row indices
    pub fn new_csc(data: Vec<T>, indices: Vec<usize>, indptr: Vec<usize>, shape: (usize, usize)) -> Self {
        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csc,
            shape,
        }
    }

    /// Row-compressed data, `indices` are column indices
    pub fn new_csr(data: Vec<T>, indices: Vec<usize>, indptr: Vec<usize>, shape: (usize, usize)) -> Self {
        Self {
            data,
            indices,
            indptr,
            cs_type: CompressedSparseFormat::Csr,
            shape,
        }
    }

    /// `(nrow, ncol)`
    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    /// Number of stored values
    pub fn nnz(&self) -> usize {
        self.data.len()
    }

    /// Number of outer slices (columns for CSC, rows for CSR)
    pub fn n_outer(&self) -> usize {
        self.indptr.len().saturating_sub(1)
    }

    /// Length of the inner dimension (rows for CSC, columns for CSR)
    pub fn n_inner(&self) -> usize {
        match self.cs_type {
            CompressedSparseFormat::Csc => self.shape.0,
            CompressedSparseFormat::Csr => self.shape.1,
        }
    }

    /// Get one outer slice
    ///
    /// ### Params
    ///
    /// * `i` - Index of the column (CSC) or row (CSR).
    ///
    /// ### Returns
    ///
    /// Tuple of `(inner indices, values)` of that slice.
    #[inline]
    pub fn outer(&self, i: usize) -> (&[usize], &[T]) {
        let range = self.indptr[i]..self.indptr[i + 1];
        (&self.indices[range.clone()], &self.data[range])
    }

    /// Same matrix in the other layout
    ///
    /// Counting sort over the inner indices. Inner indices of the result are
    /// sorted because the outer slices are visited in order.
    pub fn transposed_layout(&self) -> Self {
        let n_inner = self.n_inner();

        let mut indptr = vec![0usize; n_inner + 1];
        for &i in &self.indices {
            indptr[i + 1] += 1;
        }
        for i in 0..n_inner {
            indptr[i + 1] += indptr[i];
        }

        let mut cursor = indptr.clone();
        let mut indices = vec![0usize; self.nnz()];
        let mut data = vec![T::default(); self.nnz()];
        for outer in 0..self.n_outer() {
            let (idx, vals) = self.outer(outer);
            for (&inner, v) in idx.iter().zip(vals) {
                let pos = cursor[inner];
                indices[pos] = outer;
                data[pos] = v.clone();
                cursor[inner] += 1;
            }
        }

        Self {
            data,
            indices,
            indptr,
            cs_type: self.cs_type.flipped(),
            shape: self.shape,
        }
    }

    /// Switch between CSC and CSR, consuming the data
    pub fn transform(self) -> Self {
        self.transposed_layout()
    }

    /// Check the structural invariants of the compressed data
    ///
    /// Pointer length and monotonicity, inner index bounds and strictly
    /// increasing inner indices within each slice.
    ///
    /// ### Returns
    ///
    /// `Ok(())` or a description of the first violation.
    pub fn check_structure(&self) -> Result<(), String> {
        let n_outer = match self.cs_type {
            CompressedSparseFormat::Csc => self.shape.1,
            CompressedSparseFormat::Csr => self.shape.0,
        };
        let n_inner = self.n_inner();

        if self.indptr.len() != n_outer + 1 {
            return Err(format!(
                "index pointer has length {}, expected {}",
                self.indptr.len(),
                n_outer + 1
            ));
        }
        if self.indptr[0] != 0 || self.indptr[n_outer] != self.nnz() {
            return Err("index pointer does not span the data".to_string());
        }
        if self.indices.len() != self.nnz() {
            return Err(format!("{} indices for {} values", self.indices.len(), self.nnz()));
        }
        if let Some(pos) = self.indptr.windows(2).position(|w| w[0] > w[1]) {
            return Err(format!("index pointer decreases at position {}", pos));
        }

        (0..n_outer).try_for_each(|i| {
            let (idx, _) = self.outer(i);
            if idx.windows(2).any(|w| w[0] >= w[1]) {
                return Err(format!("inner indices of slice {} are not strictly sorted", i));
            }
            match idx.last() {
                Some(&last) if last >= n_inner => {
                    Err(format!("inner index {} out of bounds ({})", last, n_inner))
                }
                _ => Ok(()),
            }
        })
    }
}

///////////
// Tests //
///////////
