//! JSON OT type (json0)
//!
//! An operation is a list of components, each addressing a path `p` inside
//! the document:
//!
//! - `oi` / `od` - object insert / delete (both: replace)
//! - `li` / `ld` - list insert / delete (both: replace)
//! - `lm` - list move from `p[last]` to `lm`
//! - `na` - number add
//! - `si` / `sd` - string insert / delete at offset `p[last]` (UTF-16 units)

use serde_json::{Map, Value};

use super::Side;
use crate::prelude::*;

#[derive(Debug, Clone, Default, PartialEq)]
struct Component {
	p: Vec<Value>,
	na: Option<Value>,
	li: Option<Value>,
	ld: Option<Value>,
	lm: Option<i64>,
	oi: Option<Value>,
	od: Option<Value>,
	si: Option<String>,
	sd: Option<String>,
}

impl Component {
	fn is_string_op(&self) -> bool {
		self.si.is_some() || self.sd.is_some()
	}
}

fn invalid(msg: impl Into<String>) -> Error {
	Error::InvalidOp(msg.into())
}

fn parse_component(value: &Value) -> RtResult<Component> {
	let obj = value.as_object().ok_or_else(|| invalid("json0 component must be an object"))?;
	let p = match obj.get("p") {
		Some(Value::Array(p)) => p.clone(),
		None | Some(Value::Null) => Vec::new(),
		Some(_) => return Err(invalid("json0 path must be an array")),
	};
	if p.iter().any(|seg| !(seg.is_string() || seg.is_u64())) {
		return Err(invalid("json0 path segments must be keys or indexes"));
	}
	if obj.contains_key("t") {
		return Err(invalid("json0 subtype operations are not supported"));
	}
	let string_field = |key: &str| -> RtResult<Option<String>> {
		match obj.get(key) {
			None => Ok(None),
			Some(Value::String(s)) => Ok(Some(s.clone())),
			Some(_) => Err(invalid(format!("json0 '{}' must be a string", key))),
		}
	};
	let na = match obj.get("na") {
		None | Some(Value::Null) => None,
		Some(n @ Value::Number(_)) => Some(n.clone()),
		Some(_) => return Err(invalid("json0 'na' must be a number")),
	};
	let lm = match obj.get("lm") {
		None => None,
		Some(v) => Some(v.as_i64().ok_or_else(|| invalid("json0 'lm' must be an index"))?),
	};
	Ok(Component {
		p,
		na,
		li: obj.get("li").cloned(),
		ld: obj.get("ld").cloned(),
		lm,
		oi: obj.get("oi").cloned(),
		od: obj.get("od").cloned(),
		si: string_field("si")?,
		sd: string_field("sd")?,
	})
}

fn component_to_value(c: &Component) -> Value {
	let mut obj = Map::new();
	obj.insert("p".into(), Value::Array(c.p.clone()));
	if let Some(na) = &c.na {
		obj.insert("na".into(), na.clone());
	}
	if let Some(li) = &c.li {
		obj.insert("li".into(), li.clone());
	}
	if let Some(ld) = &c.ld {
		obj.insert("ld".into(), ld.clone());
	}
	if let Some(lm) = c.lm {
		obj.insert("lm".into(), Value::from(lm));
	}
	if let Some(oi) = &c.oi {
		obj.insert("oi".into(), oi.clone());
	}
	if let Some(od) = &c.od {
		obj.insert("od".into(), od.clone());
	}
	if let Some(si) = &c.si {
		obj.insert("si".into(), Value::String(si.clone()));
	}
	if let Some(sd) = &c.sd {
		obj.insert("sd".into(), Value::String(sd.clone()));
	}
	Value::Object(obj)
}

fn parse_op(op: &Value) -> RtResult<Vec<Component>> {
	match op {
		Value::Array(items) => items.iter().map(parse_component).collect(),
		Value::Object(_) => Ok(vec![parse_component(op)?]),
		_ => Err(invalid("json0 operation must be a list of components")),
	}
}

fn op_to_value(op: &[Component]) -> Value {
	Value::Array(op.iter().map(component_to_value).collect())
}

// Apply
//*******

fn index_of(seg: &Value) -> RtResult<usize> {
	seg.as_u64()
		.and_then(|i| usize::try_from(i).ok())
		.ok_or_else(|| invalid("expected a list index in path"))
}

fn navigate<'a>(mut elem: &'a mut Value, path: &[Value]) -> RtResult<&'a mut Value> {
	for seg in path {
		elem = match (elem, seg) {
			(Value::Object(map), Value::String(key)) => {
				map.get_mut(key).ok_or_else(|| invalid(format!("path key '{}' not found", key)))?
			}
			(Value::Array(list), Value::Number(_)) => {
				let idx = index_of(seg)?;
				list.get_mut(idx).ok_or_else(|| invalid(format!("path index {} out of range", idx)))?
			}
			_ => return Err(invalid("path does not match document structure")),
		};
	}
	Ok(elem)
}

fn add_numbers(a: &Value, b: &Value) -> RtResult<Value> {
	if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64())
		&& let Some(sum) = x.checked_add(y)
	{
		return Ok(Value::from(sum));
	}
	match (a.as_f64(), b.as_f64()) {
		(Some(x), Some(y)) => Ok(Value::from(x + y)),
		_ => Err(invalid("'na' target is not a number")),
	}
}

fn utf16_splice(s: &str, offset: usize, delete: usize, insert: &str) -> RtResult<String> {
	let mut units: Vec<u16> = s.encode_utf16().collect();
	let end = offset.checked_add(delete).filter(|end| *end <= units.len());
	let Some(end) = end else {
		return Err(invalid("string offset out of range"));
	};
	units.splice(offset..end, insert.encode_utf16());
	String::from_utf16(&units).map_err(|_| invalid("string edit splits a surrogate pair"))
}

fn utf16_len(s: &str) -> i64 {
	i64::try_from(s.encode_utf16().count()).unwrap_or(i64::MAX)
}

fn apply_component(root: &mut Value, c: &Component) -> RtResult<()> {
	let mut path = Vec::with_capacity(c.p.len() + 1);
	path.push(Value::String("data".into()));
	path.extend(c.p.iter().cloned());

	if let Some(na) = &c.na {
		let target = navigate(root, &path)?;
		*target = add_numbers(target, na)?;
		return Ok(());
	}

	let Some((key, parent_path)) = path.split_last() else {
		return Err(invalid("empty path"));
	};
	let parent = navigate(root, parent_path)?;

	if c.is_string_op() {
		let offset = index_of(key)?;
		let Value::String(s) = parent else {
			return Err(invalid("string operation on a non-string"));
		};
		if let Some(sd) = &c.sd {
			let len = usize::try_from(utf16_len(sd)).unwrap_or(usize::MAX);
			let current: Vec<u16> = s.encode_utf16().collect();
			let expected: Vec<u16> = sd.encode_utf16().collect();
			let end = offset.checked_add(len).ok_or_else(|| invalid("string offset out of range"))?;
			if current.get(offset..end) != Some(expected.as_slice()) {
				return Err(invalid("deleted string does not match document"));
			}
			*s = utf16_splice(s, offset, len, "")?;
		}
		if let Some(si) = &c.si {
			*s = utf16_splice(s, offset, 0, si)?;
		}
		return Ok(());
	}

	match parent {
		Value::Array(list) => {
			let idx = index_of(key)?;
			if let Some(to) = c.lm {
				let to = usize::try_from(to).map_err(|_| invalid("negative move target"))?;
				if idx >= list.len() || to >= list.len() {
					return Err(invalid("list move out of range"));
				}
				if idx != to {
					let item = list.remove(idx);
					list.insert(to, item);
				}
			} else if let (Some(_), Some(li)) = (&c.ld, &c.li) {
				let slot = list.get_mut(idx).ok_or_else(|| invalid("list replace out of range"))?;
				*slot = li.clone();
			} else if c.ld.is_some() {
				if idx >= list.len() {
					return Err(invalid("list delete out of range"));
				}
				list.remove(idx);
			} else if let Some(li) = &c.li {
				if idx > list.len() {
					return Err(invalid("list insert out of range"));
				}
				list.insert(idx, li.clone());
			} else {
				return Err(invalid("unknown list component"));
			}
		}
		Value::Object(map) => {
			let Value::String(key) = key else {
				return Err(invalid("object key must be a string"));
			};
			if c.od.is_some() {
				map.remove(key);
			}
			if let Some(oi) = &c.oi {
				map.insert(key.clone(), oi.clone());
			}
			if c.od.is_none() && c.oi.is_none() {
				return Err(invalid("unknown object component"));
			}
		}
		_ => return Err(invalid("path does not address a list or object")),
	}
	Ok(())
}

fn apply_components(data: Value, op: &[Component]) -> RtResult<Value> {
	let mut root = Value::Object(Map::from_iter([("data".to_string(), data)]));
	for c in op {
		apply_component(&mut root, c)?;
	}
	match root {
		Value::Object(mut map) => Ok(map.remove("data").unwrap_or(Value::Null)),
		_ => Err(invalid("document root lost")),
	}
}

pub fn apply(data: &Value, op: &Value) -> RtResult<Value> {
	apply_components(data.clone(), &parse_op(op)?)
}

// Compose / normalize
//*********************

fn append(dest: &mut Vec<Component>, c: Component) {
	let Some(last) = dest.last_mut() else {
		dest.push(c);
		return;
	};
	if last.p != c.p {
		dest.push(c);
		return;
	}
	if let (Some(a), Some(b)) = (&last.na, &c.na) {
		if let Ok(sum) = add_numbers(a, b) {
			last.na = Some(sum);
			return;
		}
	} else if last.li.is_some() && c.li.is_none() && c.ld.is_some() && c.ld == last.li {
		// insert followed by delete of the same item
		if last.ld.is_some() {
			last.li = None;
		} else {
			dest.pop();
		}
		return;
	} else if last.od.is_some() && last.oi.is_none() && c.oi.is_some() && c.od.is_none() {
		last.oi = c.oi;
		return;
	} else if last.oi.is_some() && c.od.is_some() {
		if c.oi.is_some() {
			last.oi = c.oi;
		} else if last.od.is_some() {
			last.oi = None;
		} else {
			dest.pop();
		}
		return;
	} else if let Some(lm) = c.lm
		&& c.p.last().and_then(Value::as_i64) == Some(lm)
	{
		return;
	}
	dest.push(c);
}

pub fn normalize(op: Value) -> RtResult<Value> {
	let mut out = Vec::new();
	for c in parse_op(&op)? {
		append(&mut out, c);
	}
	Ok(op_to_value(&out))
}

pub fn compose(op1: &Value, op2: &Value) -> RtResult<Value> {
	let mut out = parse_op(op1)?;
	for c in parse_op(op2)? {
		append(&mut out, c);
	}
	Ok(op_to_value(&out))
}

// Transform
//***********

/// Length of the shared path prefix of `a`'s operand container and `b`.
///
/// `Some(-1)` means `a` operates on the document root.
fn common_length(a: &Component, b: &Component) -> Option<isize> {
	let mut alen = a.p.len();
	let mut blen = b.p.len();
	if a.na.is_some() {
		alen += 1;
	}
	if b.na.is_some() {
		blen += 1;
	}
	if alen == 0 {
		return Some(-1);
	}
	if blen == 0 {
		return None;
	}
	alen -= 1;
	blen -= 1;
	for i in 0..alen {
		if i >= blen || a.p.get(i) != b.p.get(i) {
			return None;
		}
	}
	isize::try_from(alen).ok()
}

fn seg(p: &[Value], i: isize) -> Option<&Value> {
	usize::try_from(i).ok().and_then(|i| p.get(i))
}

fn at(p: &[Value], i: isize) -> RtResult<i64> {
	seg(p, i).and_then(Value::as_i64).ok_or_else(|| invalid("list operation on a non-list path"))
}

fn set_at(p: &mut [Value], i: isize, value: i64) -> RtResult<()> {
	let slot = usize::try_from(i)
		.ok()
		.and_then(|i| p.get_mut(i))
		.ok_or_else(|| invalid("path index out of range"))?;
	*slot = Value::from(value);
	Ok(())
}

fn shift_at(p: &mut [Value], i: isize, delta: i64) -> RtResult<()> {
	let current = at(p, i)?;
	let shifted = current.checked_add(delta).ok_or_else(|| invalid("path index out of range"))?;
	set_at(p, i, shifted)
}

fn utf16_slice(s: &str, from: usize, to: usize) -> RtResult<String> {
	let units: Vec<u16> = s.encode_utf16().collect();
	let part = units.get(from..to).ok_or_else(|| invalid("string range out of bounds"))?;
	String::from_utf16(part).map_err(|_| invalid("string edit splits a surrogate pair"))
}

fn string_component(prefix: &[Value], pos: i64, si: Option<String>, sd: Option<String>) -> Component {
	let mut p = prefix.to_vec();
	p.push(Value::from(pos));
	Component { p, si, sd, ..Component::default() }
}

/// Concurrent string edits on the same string
fn transform_string(dest: &mut Vec<Component>, c: &Component, other: &Component, side: Side) -> RtResult<()> {
	let Some((pos_seg, prefix)) = c.p.split_last() else {
		return Err(invalid("string operation without offset"));
	};
	let mut pos = pos_seg.as_i64().ok_or_else(|| invalid("string offset must be a number"))?;
	let opos = other.p.last().and_then(Value::as_i64).ok_or_else(|| invalid("string offset must be a number"))?;

	if let Some(si) = &c.si {
		if let Some(osi) = &other.si {
			if opos < pos || (opos == pos && side == Side::Right) {
				pos += utf16_len(osi);
			}
		} else if let Some(osd) = &other.sd
			&& pos > opos
		{
			pos = opos.max(pos - utf16_len(osd));
		}
		append(dest, string_component(prefix, pos, Some(si.clone()), None));
		return Ok(());
	}

	let Some(sd) = &c.sd else {
		return Ok(());
	};
	let len = utf16_len(sd);
	if let Some(osi) = &other.si {
		let ilen = utf16_len(osi);
		if opos <= pos {
			append(dest, string_component(prefix, pos + ilen, None, Some(sd.clone())));
		} else if opos < pos + len {
			let split = usize::try_from(opos - pos).map_err(|_| invalid("bad split"))?;
			let total = usize::try_from(len).map_err(|_| invalid("bad split"))?;
			let first = utf16_slice(sd, 0, split)?;
			let second = utf16_slice(sd, split, total)?;
			append(dest, string_component(prefix, pos, None, Some(first)));
			append(dest, string_component(prefix, pos + ilen, None, Some(second)));
		} else {
			append(dest, string_component(prefix, pos, None, Some(sd.clone())));
		}
		return Ok(());
	}
	if let Some(osd) = &other.sd {
		let olen = utf16_len(osd);
		let units: Vec<u16> = sd.encode_utf16().collect();
		let mut remaining = Vec::with_capacity(units.len());
		for (k, unit) in units.iter().enumerate() {
			let abs = pos + i64::try_from(k).unwrap_or(i64::MAX);
			if abs < opos || abs >= opos + olen {
				remaining.push(*unit);
			}
		}
		if remaining.is_empty() {
			return Ok(());
		}
		let remaining =
			String::from_utf16(&remaining).map_err(|_| invalid("string edit splits a surrogate pair"))?;
		let new_pos = if pos <= opos { pos } else { opos.max(pos - olen) };
		append(dest, string_component(prefix, new_pos, None, Some(remaining)));
	}
	Ok(())
}

#[allow(clippy::too_many_lines)]
fn transform_component(
	dest: &mut Vec<Component>,
	c: &Component,
	other: &Component,
	side: Side,
) -> RtResult<()> {
	let mut c = c.clone();

	if c.is_string_op()
		&& other.is_string_op()
		&& !c.p.is_empty()
		&& c.p.len() == other.p.len()
		&& c.p[..c.p.len() - 1] == other.p[..other.p.len() - 1]
	{
		return transform_string(dest, &c, other, side);
	}

	let common = common_length(other, &c);
	let common2 = common_length(&c, other);
	let mut cplength = c.p.len();
	let mut other_cplength = other.p.len();
	if c.na.is_some() {
		cplength += 1;
	}
	if other.na.is_some() {
		other_cplength += 1;
	}

	// keep deleted content in sync with changes made inside it
	if let Some(common2) = common2
		&& other_cplength > cplength
		&& seg(&c.p, common2) == seg(&other.p, common2)
	{
		let mut inner = other.clone();
		inner.p = other.p[cplength.min(other.p.len())..].to_vec();
		if let Some(ld) = c.ld.take() {
			c.ld = Some(apply_components(ld, &[inner])?);
		} else if let Some(od) = c.od.take() {
			c.od = Some(apply_components(od, &[inner])?);
		}
	}

	if let Some(common) = common {
		let common_operand = cplength == other_cplength;
		let same_slot = seg(&other.p, common) == seg(&c.p, common);

		if other.na.is_some() || other.is_string_op() {
			// no structural effect
		} else if other.li.is_some() && other.ld.is_some() {
			if same_slot {
				if !common_operand {
					return Ok(());
				} else if c.ld.is_some() {
					if c.li.is_some() && side == Side::Left {
						c.ld = other.li.clone();
					} else {
						return Ok(());
					}
				}
			}
		} else if other.li.is_some() {
			if c.li.is_some() && c.ld.is_none() && common_operand && same_slot {
				if side == Side::Right {
					shift_at(&mut c.p, common, 1)?;
				}
			} else if at(&other.p, common)? <= at(&c.p, common)? {
				shift_at(&mut c.p, common, 1)?;
			}
			if let Some(lm) = c.lm
				&& common_operand
				&& at(&other.p, common)? <= lm
			{
				c.lm = Some(lm + 1);
			}
		} else if other.ld.is_some() {
			if let Some(lm) = c.lm
				&& common_operand
			{
				if same_slot {
					return Ok(());
				}
				let p = at(&other.p, common)?;
				let from = at(&c.p, common)?;
				if p < lm || (p == lm && from < lm) {
					c.lm = Some(lm - 1);
				}
			}
			let other_idx = at(&other.p, common)?;
			let c_idx = at(&c.p, common)?;
			if other_idx < c_idx {
				shift_at(&mut c.p, common, -1)?;
			} else if other_idx == c_idx {
				if other_cplength < cplength {
					// we are below the deleted element
					return Ok(());
				} else if c.ld.is_some() {
					if c.li.is_some() {
						c.ld = None;
					} else {
						return Ok(());
					}
				}
			}
		} else if let Some(other_to) = other.lm {
			let other_from = at(&other.p, common)?;
			if let Some(to) = c.lm
				&& cplength == other_cplength
			{
				let from = at(&c.p, common)?;
				if other_from != other_to {
					if from == other_from {
						if side == Side::Left {
							set_at(&mut c.p, common, other_to)?;
							if from == to {
								c.lm = Some(other_to);
							}
						} else {
							return Ok(());
						}
					} else {
						let mut lm = to;
						if from > other_from {
							shift_at(&mut c.p, common, -1)?;
						}
						if from > other_to {
							shift_at(&mut c.p, common, 1)?;
						} else if from == other_to && other_from > other_to {
							shift_at(&mut c.p, common, 1)?;
							if from == to {
								lm += 1;
							}
						}

						if to > other_from {
							lm -= 1;
						} else if to == other_from && to > from {
							lm -= 1;
						}
						if to > other_to {
							lm += 1;
						} else if to == other_to {
							if (other_to > other_from && to > from) || (other_to < other_from && to < from) {
								if side == Side::Right {
									lm += 1;
								}
							} else if to > from {
								lm += 1;
							} else if to == other_from {
								lm -= 1;
							}
						}
						c.lm = Some(lm);
					}
				}
			} else if c.li.is_some() && c.ld.is_none() && common_operand {
				let p = at(&c.p, common)?;
				if p > other_from {
					shift_at(&mut c.p, common, -1)?;
				}
				if p > other_to {
					shift_at(&mut c.p, common, 1)?;
				}
			} else {
				let p = at(&c.p, common)?;
				if p == other_from {
					set_at(&mut c.p, common, other_to)?;
				} else {
					if p > other_from {
						shift_at(&mut c.p, common, -1)?;
					}
					if p > other_to || (p == other_to && other_from > other_to) {
						shift_at(&mut c.p, common, 1)?;
					}
				}
			}
		} else if other.oi.is_some() && other.od.is_some() {
			if same_slot {
				if c.oi.is_some() && common_operand {
					if side == Side::Right {
						return Ok(());
					}
					c.od = other.oi.clone();
				} else {
					return Ok(());
				}
			}
		} else if other.oi.is_some() {
			if c.oi.is_some() && same_slot {
				if side == Side::Left {
					append(dest, Component { p: c.p.clone(), od: other.oi.clone(), ..Component::default() });
				} else {
					return Ok(());
				}
			}
		} else if other.od.is_some() && same_slot {
			if !common_operand {
				return Ok(());
			}
			if c.oi.is_some() {
				c.od = None;
			} else {
				return Ok(());
			}
		}
	}

	append(dest, c);
	Ok(())
}

fn transform_x(mut left: Vec<Component>, right: Vec<Component>) -> RtResult<(Vec<Component>, Vec<Component>)> {
	let mut new_right = Vec::new();
	for right_c in right {
		let mut current = right_c;
		let mut consumed = false;
		let mut new_left = Vec::new();
		let mut k = 0;
		while k < left.len() {
			let mut next = Vec::new();
			transform_component(&mut new_left, &left[k], &current, Side::Left)?;
			transform_component(&mut next, &current, &left[k], Side::Right)?;
			k += 1;
			if next.len() == 1 {
				current = next.remove(0);
			} else if next.is_empty() {
				for c in &left[k..] {
					append(&mut new_left, c.clone());
				}
				consumed = true;
				break;
			} else {
				let (l, r) = transform_x(left[k..].to_vec(), next)?;
				for c in l {
					append(&mut new_left, c);
				}
				for c in r {
					append(&mut new_right, c);
				}
				consumed = true;
				break;
			}
		}
		if !consumed {
			append(&mut new_right, current);
		}
		left = new_left;
	}
	Ok((left, new_right))
}

pub fn transform(op: &Value, other: &Value, side: Side) -> RtResult<Value> {
	let op = parse_op(op)?;
	let other = parse_op(other)?;
	if other.is_empty() {
		return Ok(op_to_value(&op));
	}
	let result = if op.len() == 1 && other.len() == 1 {
		let mut dest = Vec::new();
		transform_component(&mut dest, &op[0], &other[0], side)?;
		dest
	} else {
		match side {
			Side::Left => transform_x(op, other)?.0,
			Side::Right => transform_x(other, op)?.1,
		}
	};
	Ok(op_to_value(&result))
}

/// Operation setting `path` to `value`, replacing `old` if present
pub fn set_op(path: &[Value], old: Option<&Value>, value: Value) -> Value {
	let mut c = Component { p: path.to_vec(), oi: Some(value), ..Component::default() };
	c.od = old.cloned();
	op_to_value(&[c])
}

/// Value at a json0 path, if present
pub fn get_path<'a>(data: &'a Value, path: &[Value]) -> Option<&'a Value> {
	let mut elem = data;
	for seg in path {
		elem = match (elem, seg) {
			(Value::Object(map), Value::String(key)) => map.get(key)?,
			(Value::Array(list), Value::Number(n)) => list.get(usize::try_from(n.as_u64()?).ok()?)?,
			_ => return None,
		};
	}
	Some(elem)
}


// vim: ts=4
