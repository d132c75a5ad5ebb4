//! Row-image translation
//!
//! Turns binlog row images into appended block data with `_sign`/`_version`
//! trailers:
//!
//! - writes emit one `+1` row per image, deletes one `-1` row per image,
//!   each with a freshly bumped version;
//! - updates compare the sorting-key columns of every before/after pair and
//!   emit either one `+1` row (key unchanged) or a `-1`/`+1` pair (key
//!   changed), all rows of one update event sharing a single bumped version
//!   so the collapse layer sees the pair as one change.

use crate::block::{Block, Column, ColumnData, TRAILER_COLUMNS};
use crate::error::{Result, SyncError};
use crate::value::Field;

fn field_as_wire_u64(field: &Field) -> Result<u64> {
    match field {
        Field::UInt64(value) => Ok(*value),
        Field::Int64(value) => Ok(*value as u64),
        other => Err(SyncError::logical(format!(
            "expected an integer field, got {other:?}"
        ))),
    }
}

/// Append the `column_index`-th field of every (unmasked) row image to a
/// column, truncating or widening per the destination kind.
///
/// Null fields on a nullable column append the kind's default and mark the
/// null map; on a non-nullable column they are a logical error.
pub fn write_fields_to_column(
    column: &mut Column,
    rows_data: &[Vec<Field>],
    column_index: usize,
    mask: Option<&[bool]>,
) -> Result<()> {
    for (row_index, row) in rows_data.iter().enumerate() {
        if let Some(mask) = mask {
            if !mask[row_index] {
                continue;
            }
        }

        let field = row.get(column_index).ok_or_else(|| {
            SyncError::logical(format!("row image carries no column {column_index}"))
        })?;

        if field.is_null() {
            match &mut column.null_map {
                Some(null_map) => {
                    column.data.push_default();
                    null_map.push(1);
                    continue;
                }
                None => {
                    return Err(SyncError::logical(format!(
                        "null value for non-nullable column {}",
                        column.name
                    )))
                }
            }
        }
        if let Some(null_map) = &mut column.null_map {
            null_map.push(0);
        }

        match &mut column.data {
            ColumnData::Int8(values) => values.push(field_as_wire_u64(field)? as i8),
            ColumnData::Int16(values) => values.push(field_as_wire_u64(field)? as i16),
            ColumnData::Int64(values) => values.push(field_as_wire_u64(field)? as i64),
            ColumnData::UInt8(values) => values.push(field_as_wire_u64(field)? as u8),
            ColumnData::UInt16(values) => values.push(field_as_wire_u64(field)? as u16),
            ColumnData::UInt32(values) => values.push(field_as_wire_u64(field)? as u32),
            ColumnData::UInt64(values) => values.push(field_as_wire_u64(field)?),
            ColumnData::Int32(values) => match field {
                Field::UInt64(value) => values.push(*value as i32),
                Field::Int64(value) => {
                    // MYSQL_TYPE_INT24 arrives as a 32-bit value; sign-extend
                    // when bit 23 is set.
                    let num = *value as i32;
                    values.push(if num & 0x0080_0000 != 0 {
                        num | 0xFF00_0000u32 as i32
                    } else {
                        num
                    });
                }
                other => {
                    return Err(SyncError::logical(format!(
                        "expected an integer field for column {}, got {other:?}",
                        column.name
                    )))
                }
            },
            ColumnData::Float32(values) => match field {
                Field::Float64(value) => values.push(*value as f32),
                other => {
                    return Err(SyncError::logical(format!(
                        "expected a float field for column {}, got {other:?}",
                        column.name
                    )))
                }
            },
            ColumnData::Float64(values) => match field {
                Field::Float64(value) => values.push(*value),
                other => {
                    return Err(SyncError::logical(format!(
                        "expected a float field for column {}, got {other:?}",
                        column.name
                    )))
                }
            },
            ColumnData::String(values) => match field {
                Field::Bytes(bytes) => values.push(bytes.clone()),
                other => {
                    return Err(SyncError::logical(format!(
                        "expected a string field for column {}, got {other:?}",
                        column.name
                    )))
                }
            },
            ColumnData::FixedString { len, values } => match field {
                Field::Bytes(bytes) if bytes.len() <= *len => {
                    let mut padded = bytes.clone();
                    padded.resize(*len, 0);
                    values.push(padded);
                }
                Field::Bytes(bytes) => {
                    return Err(SyncError::logical(format!(
                        "value of {} bytes does not fit FixedString({}) column {}",
                        bytes.len(),
                        len,
                        column.name
                    )))
                }
                other => {
                    return Err(SyncError::logical(format!(
                        "expected a string field for column {}, got {other:?}",
                        column.name
                    )))
                }
            },
        }
    }
    Ok(())
}

fn trailer_vectors<'a>(
    sign_column: &'a mut Column,
    version_column: &'a mut Column,
) -> Result<(&'a mut Vec<i8>, &'a mut Vec<u64>)> {
    let signs = match &mut sign_column.data {
        ColumnData::Int8(values) => values,
        _ => {
            return Err(SyncError::logical(
                "the sign trailer column must be Int8",
            ))
        }
    };
    let versions = match &mut version_column.data {
        ColumnData::UInt64(values) => values,
        _ => {
            return Err(SyncError::logical(
                "the version trailer column must be UInt64",
            ))
        }
    };
    Ok((signs, versions))
}

fn append_insert_or_delete(
    rows_data: &[Vec<Field>],
    buffer: &mut Block,
    sign: i8,
    version: &mut u64,
) -> Result<usize> {
    let prev_bytes = buffer.bytes();
    let data_columns = buffer.column_count() - TRAILER_COLUMNS;

    for column_index in 0..data_columns {
        write_fields_to_column(buffer.column_mut(column_index), rows_data, column_index, None)?;
    }

    let (sign_column, version_column) = buffer.trailer_columns_mut()?;
    let (signs, versions) = trailer_vectors(sign_column, version_column)?;
    for _ in 0..rows_data.len() {
        *version += 1;
        signs.push(sign);
        versions.push(*version);
    }

    Ok(buffer.bytes() - prev_bytes)
}

/// Append a WRITE_ROWS event: one `+1` row per image.
pub fn append_write_rows(
    rows_data: &[Vec<Field>],
    buffer: &mut Block,
    version: &mut u64,
) -> Result<usize> {
    append_insert_or_delete(rows_data, buffer, 1, version)
}

/// Append a DELETE_ROWS event: one `-1` row per image.
pub fn append_delete_rows(
    rows_data: &[Vec<Field>],
    buffer: &mut Block,
    version: &mut u64,
) -> Result<usize> {
    append_insert_or_delete(rows_data, buffer, -1, version)
}

fn sorting_keys_differ(
    row_old_data: &[Field],
    row_new_data: &[Field],
    sorting_columns_index: &[usize],
) -> Result<bool> {
    for &index in sorting_columns_index {
        let old = row_old_data
            .get(index)
            .ok_or_else(|| SyncError::logical(format!("row image carries no column {index}")))?;
        let new = row_new_data
            .get(index)
            .ok_or_else(|| SyncError::logical(format!("row image carries no column {index}")))?;
        if old != new {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Append an UPDATE_ROWS event (images interleaved before/after).
///
/// The after image is always emitted with sign `+1`; the before image is
/// emitted with sign `-1` only when a sorting-key column changed, since the
/// collapse layer would otherwise keep the stale key around. Every row this
/// event produces shares one bumped version.
pub fn append_update_rows(
    rows_data: &[Vec<Field>],
    buffer: &mut Block,
    version: &mut u64,
    sorting_columns_index: &[usize],
) -> Result<usize> {
    if rows_data.len() % 2 != 0 {
        return Err(SyncError::logical(
            "update event carries an odd number of row images",
        ));
    }

    let prev_bytes = buffer.bytes();
    let mut writeable_rows_mask = vec![false; rows_data.len()];
    for index in (0..rows_data.len()).step_by(2) {
        writeable_rows_mask[index + 1] = true;
        writeable_rows_mask[index] = sorting_keys_differ(
            &rows_data[index],
            &rows_data[index + 1],
            sorting_columns_index,
        )?;
    }

    let data_columns = buffer.column_count() - TRAILER_COLUMNS;
    for column_index in 0..data_columns {
        write_fields_to_column(
            buffer.column_mut(column_index),
            rows_data,
            column_index,
            Some(&writeable_rows_mask),
        )?;
    }

    *version += 1;
    let event_version = *version;

    let (sign_column, version_column) = buffer.trailer_columns_mut()?;
    let (signs, versions) = trailer_vectors(sign_column, version_column)?;
    for index in (0..rows_data.len()).step_by(2) {
        if !writeable_rows_mask[index] {
            signs.push(1);
            versions.push(event_version);
        } else {
            // The sorting key moved: cancel the old row, then assert the new.
            signs.push(-1);
            signs.push(1);
            versions.push(event_version);
            versions.push(event_version);
        }
    }

    Ok(buffer.bytes() - prev_bytes)
}
