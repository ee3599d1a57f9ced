//! Column-oriented observation tables with missing values.

use std::collections::HashSet;

use nalgebra::{DMatrix, DVector};

use crate::error::{HdfeError, Result};

/// A single table column. `None` marks a missing value.
#[derive(Clone, Debug, PartialEq)]
pub enum Column {
    /// Numeric column.
    Numeric(Vec<Option<f64>>),
    /// Categorical column; levels are compared by their string label.
    Categorical(Vec<Option<String>>),
}

impl Column {
    /// Number of rows in the column.
    pub fn len(&self) -> usize {
        match self {
            Column::Numeric(values) => values.len(),
            Column::Categorical(values) => values.len(),
        }
    }

    /// Returns `true` when the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` when row `index` holds a value.
    pub fn is_present(&self, index: usize) -> bool {
        match self {
            Column::Numeric(values) => values[index].is_some(),
            Column::Categorical(values) => values[index].is_some(),
        }
    }
}

/// Represents an in-memory, column-oriented observation table.
#[derive(Clone, Debug)]
pub struct Table {
    names: Vec<String>,
    columns: Vec<Column>,
    rows: usize,
}

impl Table {
    /// Start building a table.
    pub fn builder() -> TableBuilder {
        TableBuilder::default()
    }

    /// Number of rows in the table.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Names of the columns, in insertion order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Result<&Column> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| &self.columns[index])
            .ok_or_else(|| HdfeError::unknown_column(name))
    }

    /// Returns the numeric column `name`, failing if it is categorical.
    pub fn numeric(&self, name: &str) -> Result<&[Option<f64>]> {
        match self.column(name)? {
            Column::Numeric(values) => Ok(values),
            Column::Categorical(_) => Err(HdfeError::WrongColumnType {
                name: name.to_string(),
                expected: "numeric",
            }),
        }
    }

    /// Returns the categorical column `name`, failing if it is numeric.
    pub fn categorical(&self, name: &str) -> Result<&[Option<String>]> {
        match self.column(name)? {
            Column::Categorical(values) => Ok(values),
            Column::Numeric(_) => Err(HdfeError::WrongColumnType {
                name: name.to_string(),
                expected: "categorical",
            }),
        }
    }

    /// Mask of rows where every listed column is non-missing.
    pub fn complete_cases<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<bool>> {
        let mut mask = vec![true; self.rows];
        for name in names {
            let column = self.column(name.as_ref())?;
            for (row, keep) in mask.iter_mut().enumerate() {
                *keep &= column.is_present(row);
            }
        }
        Ok(mask)
    }

    /// Extracts the masked rows of a numeric column as a dense vector.
    ///
    /// Rows selected by `mask` must be complete; a missing value there is an
    /// invalid argument.
    pub fn numeric_vector(&self, name: &str, mask: &[bool]) -> Result<DVector<f64>> {
        let values = self.numeric(name)?;
        if mask.len() != values.len() {
            return Err(HdfeError::length_mismatch(
                "row mask",
                values.len(),
                mask.len(),
            ));
        }
        let mut out = Vec::with_capacity(mask.iter().filter(|m| **m).count());
        for (value, _) in values.iter().zip(mask).filter(|(_, keep)| **keep) {
            let value = value.ok_or_else(|| {
                HdfeError::invalid(format!("column `{name}` has a missing value in the sample"))
            })?;
            out.push(value);
        }
        Ok(DVector::from_vec(out))
    }

    /// Stacks several numeric columns over the masked rows.
    pub fn numeric_matrix<S: AsRef<str>>(&self, names: &[S], mask: &[bool]) -> Result<DMatrix<f64>> {
        let rows = mask.iter().filter(|m| **m).count();
        let mut matrix = DMatrix::zeros(rows, names.len());
        for (j, name) in names.iter().enumerate() {
            let column = self.numeric_vector(name.as_ref(), mask)?;
            matrix.set_column(j, &column);
        }
        Ok(matrix)
    }
}

/// Builder that validates column lengths and names before constructing a [`Table`].
#[derive(Debug, Default)]
pub struct TableBuilder {
    names: Vec<String>,
    columns: Vec<Column>,
}

impl TableBuilder {
    /// Adds a fully observed numeric column.
    pub fn numeric<S: Into<String>>(self, name: S, values: Vec<f64>) -> Self {
        self.column(name, Column::Numeric(values.into_iter().map(Some).collect()))
    }

    /// Adds a numeric column that may contain missing values.
    pub fn numeric_with_missing<S: Into<String>>(self, name: S, values: Vec<Option<f64>>) -> Self {
        self.column(name, Column::Numeric(values))
    }

    /// Adds a fully observed categorical column from any displayable labels.
    pub fn categorical<S, I, T>(self, name: S, labels: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = T>,
        T: ToString,
    {
        let values = labels
            .into_iter()
            .map(|label| Some(label.to_string()))
            .collect();
        self.column(name, Column::Categorical(values))
    }

    /// Adds a categorical column that may contain missing values.
    pub fn categorical_with_missing<S: Into<String>>(
        self,
        name: S,
        labels: Vec<Option<String>>,
    ) -> Self {
        self.column(name, Column::Categorical(labels))
    }

    /// Adds an arbitrary column.
    pub fn column<S: Into<String>>(mut self, name: S, column: Column) -> Self {
        self.names.push(name.into());
        self.columns.push(column);
        self
    }

    /// Finalizes construction after validating shapes and names.
    pub fn build(self) -> Result<Table> {
        let rows = self.columns.first().map(Column::len).unwrap_or(0);
        let mut seen = HashSet::new();
        for (name, column) in self.names.iter().zip(&self.columns) {
            if !seen.insert(name.as_str()) {
                return Err(HdfeError::invalid(format!("duplicate column `{name}`")));
            }
            if column.len() != rows {
                return Err(HdfeError::length_mismatch("column length", rows, column.len()));
            }
        }
        Ok(Table {
            names: self.names,
            columns: self.columns,
            rows,
        })
    }
}
