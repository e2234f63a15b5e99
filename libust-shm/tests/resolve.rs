// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libust_shm::{ShmObjectTable, ShmPtr, ShmRef};
use proptest::prelude::*;

const SIZES: [usize; 3] = [1, 100, 4096];

fn table() -> ShmObjectTable {
    let mut table = ShmObjectTable::create(4);
    for size in SIZES {
        table.append(size).unwrap();
    }
    table
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: if cfg!(miri) { 4 } else { 256 },
        .. ProptestConfig::default()
    })]

    #[test]
    #[cfg_attr(miri, ignore)]
    fn proptest_resolve_stays_in_bounds(
        index in -2i64..6,
        offset in prop_oneof![-8i64..4200, Just(i64::MAX), Just(i64::MIN)],
        element in 0usize..64,
    ) {
        let table = table();
        let expected = usize::try_from(index)
            .ok()
            .and_then(|i| SIZES.get(i).copied())
            .zip(usize::try_from(offset).ok())
            .is_some_and(|(size, offset)| offset.saturating_add(element) < size);

        let ptr = ShmPtr::<u8>::new(ShmRef::new(index, offset));
        prop_assert_eq!(expected.then_some(0), table.load_index(&ptr, element));

        let byte = table.resolve_offset(&ShmRef::new(index, offset), element, 1);
        prop_assert_eq!(expected, byte.is_some());
        if let Some(byte) = byte {
            // Safety: resolved for one byte, the table is still alive.
            prop_assert_eq!(0, unsafe { byte.as_ptr().read_volatile() });
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn proptest_elements_fit_entirely(offset in 0i64..4200, element in 0usize..600) {
        let table = table();
        let ptr = ShmPtr::<u64>::new(ShmRef::new(2, offset));
        let end = offset as usize + element * 8 + 8;
        let aligned = offset % 8 == 0;
        prop_assert_eq!(end <= 4096 && aligned, table.load_index(&ptr, element).is_some());
    }
}
