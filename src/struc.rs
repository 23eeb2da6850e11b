use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt::Write;

/// Stable identity of a struct inside a [`StrucStore`]. Pointer fields carry
/// ids, never ownership, so reference cycles between structs are fine.
pub type StrucId = usize;

/// Field type priority: a weaker type never displaces a stronger one at the
/// same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FieldType {
    UInt,
    Int,
    Float,
    Pointer,
    Struc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signedness {
    Unsigned,
    Signed,
}

#[derive(Debug, Clone, Copy)]
pub struct Field {
    ty: FieldType,
    size: usize,
    count: usize,
    struc: Option<StrucId>,
}

impl Field {
    pub fn new(ty: FieldType, size: usize, count: usize, struc: Option<StrucId>) -> Self {
        Self {
            ty,
            size,
            count,
            struc,
        }
    }

    pub fn ty(&self) -> FieldType {
        self.ty
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn struc(&self) -> Option<StrucId> {
        self.struc
    }

    fn is_pointer_alias(&self, _size: usize) -> bool {
        self.size == 8 && matches!(self.ty, FieldType::Int | FieldType::UInt | FieldType::Pointer)
    }

    fn is_float_alias(&self, size: usize) -> bool {
        self.size == size && matches!(self.ty, FieldType::Int | FieldType::UInt | FieldType::Float)
    }

    fn is_typed_int_alias(&self, size: usize) -> bool {
        self.size == size
            && matches!(
                self.ty,
                FieldType::Int | FieldType::UInt | FieldType::Float | FieldType::Pointer
            )
    }

    fn type_token(&self, store: &StrucStore) -> String {
        match self.ty {
            FieldType::UInt => match self.size {
                1 => "uint8_t".into(),
                2 => "uint16_t".into(),
                4 => "uint32_t".into(),
                8 => "uint64_t".into(),
                _ => String::new(),
            },
            FieldType::Int => match self.size {
                1 => "int8_t".into(),
                2 => "int16_t".into(),
                4 => "int32_t".into(),
                8 => "int64_t".into(),
                _ => String::new(),
            },
            FieldType::Float => match self.size {
                2 => "f16_t".into(),
                4 => "float".into(),
                8 => "double".into(),
                10 => "long double".into(),
                _ => String::new(),
            },
            FieldType::Pointer => match self.struc {
                Some(id) => format!("{}*", store.get(id).name()),
                None => "void*".into(),
            },
            FieldType::Struc => match self.struc {
                Some(id) => store.get(id).name().to_string(),
                None => String::new(),
            },
        }
    }
}

/// Ordered multimap of fields keyed by starting offset. Several fields at
/// the same offset form a union; `field_set` records every offset any field
/// element covers.
#[derive(Debug, Default)]
pub struct Struc {
    name: String,
    fields: BTreeMap<u64, Vec<Field>>,
    field_set: BTreeSet<u64>,
}

impl Struc {
    pub fn new(name: String) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fields flattened in offset order.
    pub fn fields(&self) -> impl Iterator<Item = (u64, &Field)> {
        self.fields
            .iter()
            .flat_map(|(&offset, bag)| bag.iter().map(move |field| (offset, field)))
    }

    pub fn field_set(&self) -> &BTreeSet<u64> {
        &self.field_set
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn add_int_field(&mut self, offset: u64, size: usize, signedness: Signedness, count: usize) {
        debug_assert!(size.is_power_of_two() && size <= 64);
        if self.has_aliases(offset, Field::is_typed_int_alias, size) {
            return;
        }
        let ty = match signedness {
            Signedness::Unsigned => FieldType::UInt,
            Signedness::Signed => FieldType::Int,
        };
        self.add_field(offset, Field::new(ty, size, count, None));
    }

    pub fn add_float_field(&mut self, offset: u64, size: usize, count: usize) {
        debug_assert!(matches!(size, 2 | 4 | 8 | 10));
        let max_removed = self.remove_aliases(offset, Field::is_float_alias, size);
        self.add_field(
            offset,
            Field::new(FieldType::Float, size, count.max(max_removed), None),
        );
    }

    pub fn add_pointer_field(&mut self, offset: u64, count: usize, struc: Option<StrucId>) {
        let max_removed = self.remove_aliases(offset, Field::is_pointer_alias, 8);
        self.add_field(
            offset,
            Field::new(FieldType::Pointer, 8, count.max(max_removed), struc),
        );
    }

    pub fn add_struc_field(&mut self, offset: u64, struc: StrucId, count: usize) {
        self.add_field(offset, Field::new(FieldType::Struc, 0, count, Some(struc)));
    }

    pub fn add_field(&mut self, offset: u64, field: Field) {
        if self.is_duplicate(offset, &field) {
            return;
        }
        for i in 0..field.count() {
            self.field_set.insert(offset + (i * field.size()) as u64);
        }
        self.fields.entry(offset).or_default().push(field);
    }

    /// A field is a duplicate when an existing field of the same size and
    /// alignment already covers the offset with an equal or stronger type.
    fn is_duplicate(&self, offset: u64, field: &Field) -> bool {
        if self.fields.is_empty() {
            return false;
        }
        'outer: for (&current_offset, bag) in self.fields.range(..=offset).rev() {
            for current in bag {
                let current_end = current_offset + (current.count() * current.size()) as u64;
                if current_end <= offset {
                    break 'outer;
                }
                if current.size() != field.size() {
                    continue;
                }
                if field.size() > 0
                    && current_offset % field.size() as u64 != offset % field.size() as u64
                {
                    continue;
                }
                let covered = match current.ty() {
                    FieldType::UInt | FieldType::Int => field.is_typed_int_alias(current.size()),
                    FieldType::Float => field.is_float_alias(current.size()),
                    FieldType::Pointer => field.is_pointer_alias(current.size()),
                    FieldType::Struc => field.ty() == FieldType::Struc,
                };
                if covered && field.ty() <= current.ty() {
                    return true;
                }
            }
        }
        false
    }

    fn has_aliases(
        &self,
        offset: u64,
        alias_check: fn(&Field, usize) -> bool,
        size: usize,
    ) -> bool {
        self.fields
            .get(&offset)
            .is_some_and(|bag| bag.iter().any(|field| alias_check(field, size)))
    }

    /// Removes aliased fields at `offset`, returning the largest count seen
    /// so a replacement can inherit array-ness.
    fn remove_aliases(
        &mut self,
        offset: u64,
        alias_check: fn(&Field, usize) -> bool,
        size: usize,
    ) -> usize {
        let mut max_count = 1;
        if let Some(bag) = self.fields.get_mut(&offset) {
            for field in bag.iter() {
                max_count = max_count.max(field.count());
            }
            bag.retain(|field| !alias_check(field, size));
            if bag.is_empty() {
                self.fields.remove(&offset);
            }
        }
        max_count
    }

    pub fn has_field_at_offset(&self, offset: u64) -> bool {
        self.field_set.contains(&offset)
    }

    /// Size up to the end of the largest field starting at the last offset.
    pub fn get_size(&self) -> u64 {
        let Some((&last_offset, bag)) = self.fields.iter().next_back() else {
            return 0;
        };
        last_offset
            + bag
                .iter()
                .map(|field| (field.size() * field.count()) as u64)
                .max()
                .unwrap_or(0)
    }

    /// Renders the C-like declaration: explicit padding between runs, unions
    /// for overlapping fields, nested anonymous structs for union members
    /// that start past the union base.
    pub fn print(&self, out: &mut String, store: &StrucStore) {
        let _ = writeln!(out, "struct {} {{", self.name);
        let entries: Vec<(u64, &Field)> = self.fields().collect();
        let mut next_offset = 0u64;
        let mut i = 0;
        while i < entries.len() {
            let (base_offset, first) = entries[i];
            if base_offset > next_offset {
                let _ = writeln!(
                    out,
                    "    char _padding_{:04x}[0x{:04x}];",
                    next_offset,
                    base_offset - next_offset
                );
            }
            next_offset = base_offset + (first.size() * first.count()) as u64;
            let mut union_len = 1;
            while i + union_len < entries.len() {
                let (prev_offset, prev) = entries[i + union_len - 1];
                let prev_end = prev_offset + (prev.size() * prev.count()) as u64;
                if prev_end <= entries[i + union_len].0 {
                    break;
                }
                next_offset = next_offset.max(prev_end);
                union_len += 1;
            }
            let is_union = union_len > 1;
            let indent = if is_union {
                let _ = writeln!(out, "    union {{");
                "        "
            } else {
                "    "
            };
            for j in 0..union_len {
                let (offset, field) = entries[i + j];
                if offset == base_offset {
                    let _ = write!(
                        out,
                        "{}{} field_{:04x}",
                        indent,
                        field.type_token(store),
                        offset
                    );
                    if is_union {
                        let _ = write!(out, "_{}", j + 1);
                    }
                    if field.count() > 1 {
                        let _ = write!(out, "[{}]", field.count());
                    }
                } else {
                    let _ = write!(
                        out,
                        "{}struct {{ char _padding[0x{:04x}]; {} value",
                        indent,
                        offset - base_offset,
                        field.type_token(store)
                    );
                    if field.count() > 1 {
                        let _ = write!(out, "[{}]", field.count());
                    }
                    let _ = write!(out, "; }} field_{:04x}", offset);
                    if is_union {
                        let _ = write!(out, "_{}", j + 1);
                    }
                }
                let _ = writeln!(out, ";");
            }
            if is_union {
                let _ = writeln!(out, "    }};");
            }
            i += union_len;
        }
        let _ = writeln!(out, "}};");
    }
}

/// Arena of recovered structs. Merging redirects the absorbed struct onto
/// the survivor so pointer fields keep resolving to a live name.
#[derive(Debug, Default)]
pub struct StrucStore {
    strucs: Vec<Struc>,
    redirects: HashMap<StrucId, StrucId>,
}

impl StrucStore {
    pub fn insert(&mut self, struc: Struc) -> StrucId {
        self.strucs.push(struc);
        self.strucs.len() - 1
    }

    pub fn resolve(&self, mut id: StrucId) -> StrucId {
        while let Some(&next) = self.redirects.get(&id) {
            id = next;
        }
        id
    }

    pub fn get(&self, id: StrucId) -> &Struc {
        &self.strucs[self.resolve(id)]
    }

    pub fn get_mut(&mut self, id: StrucId) -> &mut Struc {
        let id = self.resolve(id);
        &mut self.strucs[id]
    }

    /// Structs that were not absorbed into another one.
    pub fn live(&self) -> impl Iterator<Item = (StrucId, &Struc)> {
        self.strucs
            .iter()
            .enumerate()
            .filter(|(id, _)| !self.redirects.contains_key(id))
    }

    /// Folds `src` into `dst` field by field. A pointer-to-struct field
    /// whose offset lands on an existing pointer field merges the pointees
    /// recursively; everything else goes through the add rules. `src` is
    /// redirected onto `dst` afterwards.
    pub fn merge(&mut self, dst: StrucId, src: StrucId) {
        let mut visited = HashSet::new();
        self.merge_inner(self.resolve(dst), self.resolve(src), &mut visited);
    }

    fn merge_inner(
        &mut self,
        dst: StrucId,
        src: StrucId,
        visited: &mut HashSet<(StrucId, StrucId)>,
    ) {
        if dst == src || !visited.insert((dst, src)) {
            return;
        }
        let src_fields: Vec<(u64, Field)> = self.strucs[src]
            .fields()
            .map(|(offset, field)| (offset, *field))
            .collect();
        for (offset, field) in src_fields {
            if !self.merge_pointee_at(dst, offset, &field, visited) {
                self.merge_field(dst, offset, field);
            }
        }
        self.redirects.insert(src, dst);
    }

    fn merge_pointee_at(
        &mut self,
        dst: StrucId,
        offset: u64,
        src_field: &Field,
        visited: &mut HashSet<(StrucId, StrucId)>,
    ) -> bool {
        let (FieldType::Pointer, Some(pointee)) = (src_field.ty(), src_field.struc()) else {
            return false;
        };
        let mut targets = Vec::new();
        'outer: for (&current_offset, bag) in self.strucs[dst].fields.range(..=offset).rev() {
            for current in bag {
                let current_end = current_offset + (current.count() * current.size()) as u64;
                if current_end <= offset {
                    break 'outer;
                }
                if current.ty() != FieldType::Pointer
                    || current.struc().is_none()
                    || current_offset % 8 != offset % 8
                {
                    continue;
                }
                targets.push(current.struc().unwrap_or_default());
            }
        }
        for target in &targets {
            self.merge_inner(self.resolve(*target), self.resolve(pointee), visited);
        }
        !targets.is_empty()
    }

    fn merge_field(&mut self, dst: StrucId, offset: u64, field: Field) {
        let struc = &mut self.strucs[dst];
        if !struc.has_field_at_offset(offset) {
            struc.add_field(offset, field);
            return;
        }
        if struc.is_duplicate(offset, &field) {
            return;
        }
        match field.ty() {
            FieldType::Pointer if field.struc().is_some() => {
                struc.add_pointer_field(offset, 1, field.struc());
            }
            FieldType::Float => struc.add_float_field(offset, field.size(), field.count()),
            _ => struc.add_field(offset, field),
        }
    }

    /// Merges `src` into the pointee of `dst`'s pointer field at `offset`;
    /// adds the pointer field when none exists yet.
    pub fn merge_struc_field_at_offset(&mut self, dst: StrucId, offset: u64, src: StrucId) {
        let field = Field::new(FieldType::Pointer, 8, 1, Some(src));
        let mut visited = HashSet::new();
        let dst = self.resolve(dst);
        if !self.merge_pointee_at(dst, offset, &field, &mut visited) {
            self.get_mut(dst).add_pointer_field(offset, 1, Some(src));
        }
    }

    /// Renders every live struct, ordered by name.
    pub fn dump(&self, out: &mut String) {
        let mut by_name: Vec<&Struc> = self.live().map(|(_, struc)| struc).collect();
        by_name.sort_by(|a, b| a.name().cmp(b.name()));
        for struc in by_name {
            struc.print(out, self);
            out.push('\n');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_wins_over_int_at_same_offset_and_size() {
        let mut struc = Struc::new("S".into());
        struc.add_int_field(4, 4, Signedness::Unsigned, 1);
        struc.add_float_field(4, 4, 1);
        let fields: Vec<_> = struc.fields().collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].1.ty(), FieldType::Float);

        // And the reverse insertion order keeps the float too.
        let mut struc = Struc::new("S".into());
        struc.add_float_field(4, 4, 1);
        struc.add_int_field(4, 4, Signedness::Unsigned, 1);
        let fields: Vec<_> = struc.fields().collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].1.ty(), FieldType::Float);
    }

    #[test]
    fn pointer_overrides_preexisting_int() {
        let mut store = StrucStore::default();
        let pointee = store.insert(Struc::new("P".into()));
        let mut struc = Struc::new("S".into());
        struc.add_int_field(8, 8, Signedness::Unsigned, 1);
        struc.add_pointer_field(8, 1, Some(pointee));
        let fields: Vec<_> = struc.fields().collect();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].1.ty(), FieldType::Pointer);
        assert_eq!(fields[0].1.struc(), Some(pointee));
    }

    #[test]
    fn field_set_covers_every_array_element() {
        let mut struc = Struc::new("S".into());
        struc.add_int_field(0x10, 4, Signedness::Unsigned, 3);
        let expected: BTreeSet<u64> = [0x10, 0x14, 0x18].into_iter().collect();
        assert_eq!(struc.field_set(), &expected);
        assert_eq!(struc.get_size(), 0x1C);
    }

    #[test]
    fn get_size_spans_the_largest_last_field() {
        let mut struc = Struc::new("S".into());
        struc.add_int_field(0, 4, Signedness::Unsigned, 1);
        struc.add_int_field(8, 4, Signedness::Unsigned, 1);
        struc.add_int_field(8, 8, Signedness::Unsigned, 2);
        assert_eq!(struc.get_size(), 24);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut store = StrucStore::default();
        let a = store.insert(Struc::new("A".into()));
        let b = store.insert(Struc::new("B".into()));
        store.get_mut(a).add_int_field(0, 4, Signedness::Unsigned, 1);
        store.get_mut(b).add_int_field(0, 4, Signedness::Unsigned, 1);
        store.get_mut(b).add_float_field(8, 4, 1);
        store.merge(a, b);
        let fields: Vec<_> = store.get(a).fields().map(|(o, f)| (o, f.ty())).collect();
        assert_eq!(
            fields,
            vec![(0, FieldType::UInt), (8, FieldType::Float)]
        );
        // Merging again changes nothing.
        store.merge(a, b);
        assert_eq!(store.get(a).fields().count(), 2);
        // The absorbed struct resolves to the survivor.
        assert_eq!(store.resolve(b), a);
        assert_eq!(store.live().count(), 1);
    }

    #[test]
    fn merge_recurses_into_pointees() {
        let mut store = StrucStore::default();
        let a = store.insert(Struc::new("A".into()));
        let pa = store.insert(Struc::new("PA".into()));
        let b = store.insert(Struc::new("B".into()));
        let pb = store.insert(Struc::new("PB".into()));
        store.get_mut(pa).add_int_field(0, 4, Signedness::Unsigned, 1);
        store.get_mut(pb).add_int_field(4, 4, Signedness::Unsigned, 1);
        store.get_mut(a).add_pointer_field(0, 1, Some(pa));
        store.get_mut(b).add_pointer_field(0, 1, Some(pb));
        store.merge(a, b);
        let merged: Vec<u64> = store.get(pa).fields().map(|(o, _)| o).collect();
        assert_eq!(merged, vec![0, 4]);
        assert_eq!(store.resolve(pb), pa);
    }

    #[test]
    fn merge_survives_reference_cycles() {
        let mut store = StrucStore::default();
        let a = store.insert(Struc::new("A".into()));
        let b = store.insert(Struc::new("B".into()));
        store.get_mut(a).add_pointer_field(0, 1, Some(b));
        store.get_mut(b).add_pointer_field(0, 1, Some(a));
        let c = store.insert(Struc::new("C".into()));
        let d = store.insert(Struc::new("D".into()));
        store.get_mut(c).add_pointer_field(0, 1, Some(d));
        store.get_mut(d).add_pointer_field(0, 1, Some(c));
        store.merge(a, c);
        assert_eq!(store.resolve(c), a);
    }

    #[test]
    fn print_emits_padding_and_arrays() {
        let store = StrucStore::default();
        let mut struc = Struc::new("Demo".into());
        struc.add_int_field(0x10, 8, Signedness::Unsigned, 1);
        struc.add_int_field(0x18, 4, Signedness::Unsigned, 4);
        let mut out = String::new();
        struc.print(&mut out, &store);
        let expected = "struct Demo {\n\
                        \x20   char _padding_0000[0x0010];\n\
                        \x20   uint64_t field_0010;\n\
                        \x20   uint32_t field_0018[4];\n\
                        };\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn print_renders_overlapping_fields_as_a_union() {
        let store = StrucStore::default();
        let mut struc = Struc::new("U".into());
        struc.add_int_field(0, 8, Signedness::Unsigned, 1);
        struc.add_int_field(0, 4, Signedness::Unsigned, 1);
        let mut out = String::new();
        struc.print(&mut out, &store);
        let expected = "struct U {\n\
                        \x20   union {\n\
                        \x20       uint64_t field_0000_1;\n\
                        \x20       uint32_t field_0000_2;\n\
                        \x20   };\n\
                        };\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn print_nests_union_members_past_the_base_offset() {
        let store = StrucStore::default();
        let mut struc = Struc::new("U".into());
        struc.add_int_field(0, 8, Signedness::Unsigned, 1);
        struc.add_int_field(4, 2, Signedness::Unsigned, 1);
        let mut out = String::new();
        struc.print(&mut out, &store);
        let expected = "struct U {\n\
                        \x20   union {\n\
                        \x20       uint64_t field_0000_1;\n\
                        \x20       struct { char _padding[0x0004]; uint16_t value; } field_0004_2;\n\
                        \x20   };\n\
                        };\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn print_resolves_pointer_names_through_redirects() {
        let mut store = StrucStore::default();
        let a = store.insert(Struc::new("A".into()));
        let b = store.insert(Struc::new("B".into()));
        store.get_mut(b).add_int_field(0, 4, Signedness::Unsigned, 1);
        let holder = store.insert(Struc::new("Holder".into()));
        store.get_mut(holder).add_pointer_field(8, 1, Some(b));
        store.get_mut(a).add_int_field(0, 4, Signedness::Unsigned, 1);
        store.merge(a, b);
        let mut out = String::new();
        store.get(holder).print(&mut out, &store);
        assert!(out.contains("A* field_0008;"));
    }
}
