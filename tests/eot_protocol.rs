//! # Writer EOT Protocol Tests
//!
//! Exercises the writer engine end to end against a real shadow file
//! and scripted collaborators:
//!
//! 1. A quiet writer publishes empty indices and advances its tick
//! 2. Rewriting a page defers the old image and releases it only after
//!    max_lag ticks
//! 3. Outgrowing the index region doubles it and parks the old region
//! 4. Flush/close drain the delayed-write list a tick at a time
//!
//! Each publication is read back through the codec to check the
//! on-disk pairing of header and index ticks.

use tempfile::tempdir;

mod common;
use common::{open_writer, read_shadow, writer_config, Event};

mod quiet_writer_tests {
    use super::*;

    #[test]
    fn three_quiet_ticks_publish_empty_indices() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        for _ in 0..3 {
            fx.writer.end_of_tick().unwrap();
        }

        assert_eq!(fx.writer.tick(), 4, "tick SHOULD advance once per EOT");
        assert!(fx.writer.index().is_empty());
        assert!(fx.writer.deferred_frees().is_empty());

        let md_len = std::fs::metadata(&config.md_file_path).unwrap().len();
        assert_eq!(md_len, 8192, "2 reserved pages of 4096 bytes");

        let (header, index_tick, entries) = read_shadow(&config.md_file_path);
        assert_eq!(header.tick(), 3, "last publication happened at tick 3");
        assert_eq!(index_tick, 3);
        assert!(entries.is_empty());
    }

    #[test]
    fn header_and_index_ticks_always_pair() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        for round in 0..5 {
            if round % 2 == 0 {
                fx.pb.dirty(round + 1, &[round as u8; 4096]);
            }
            fx.writer.end_of_tick().unwrap();

            let (header, index_tick, _) = read_shadow(&config.md_file_path);
            assert_eq!(
                header.tick(),
                index_tick,
                "header and index SHOULD never advertise different ticks"
            );
        }
    }

    #[test]
    fn attaching_to_an_existing_primary_publishes_immediately() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let fx = open_writer(config.clone(), false);

        let (header, index_tick, entries) = read_shadow(&config.md_file_path);
        assert_eq!(header.tick(), 1);
        assert_eq!(index_tick, 1);
        assert!(entries.is_empty());
        assert_eq!(fx.writer.tick(), 1, "no EOT has run yet");
    }

    #[test]
    fn driver_is_truncated_once_per_tick() {
        let dir = tempdir().unwrap();
        let mut fx = open_writer(writer_config(dir.path()), true);

        for _ in 0..3 {
            fx.writer.end_of_tick().unwrap();
        }

        let driver = fx.driver.state.lock();
        assert_eq!(driver.truncates, 3);
        assert_eq!(driver.aggregator_releases, 3);
        assert_eq!(driver.raw_flushes, 0, "flush_raw_data is off in this config");
    }
}

mod page_rewrite_tests {
    use super::*;

    #[test]
    fn rewrite_defers_the_old_image_and_releases_it_after_the_lag() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        fx.pb.dirty(7, &[0xAA; 4096]);
        fx.writer.end_of_tick().unwrap();
        let first_shadow_page = fx.writer.index().lookup(7).unwrap().shadow_page;
        assert_ne!(first_shadow_page, 0, "the image SHOULD have been flushed");

        fx.pb.dirty(7, &[0xBB; 4096]);
        fx.writer.end_of_tick().unwrap();

        let entry = fx.writer.index().lookup(7).unwrap();
        assert_ne!(entry.shadow_page, first_shadow_page);
        assert!(entry.image.is_none(), "no unflushed image after an EOT");

        // The shadow file holds the second image at the new location.
        let shadow = shadowtick::shadow::ShadowFile::open_readonly(&config.md_file_path).unwrap();
        let mut buf = vec![0u8; 4096];
        shadow.read_at(entry.shadow_page * 4096, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xBB));

        // The first image's range is parked, tagged with tick 2.
        assert_eq!(fx.writer.deferred_frees().len(), 1);
        let record = *fx.writer.deferred_frees().iter().next().unwrap();
        assert_eq!(record.offset, first_shadow_page * 4096);
        assert_eq!(record.length, 4096);
        assert_eq!(record.tick, 2);

        // max_lag is 3: the EOTs at ticks 3 and 4 leave it parked, the
        // EOT at tick 5 releases it.
        fx.writer.end_of_tick().unwrap();
        assert_eq!(fx.writer.deferred_frees().len(), 1);
        fx.writer.end_of_tick().unwrap();
        assert_eq!(fx.writer.deferred_frees().len(), 1);
        fx.writer.end_of_tick().unwrap();
        assert!(
            fx.writer.deferred_frees().is_empty(),
            "the tick-2 record SHOULD be released during the tick-5 EOT"
        );
    }

    #[test]
    fn published_entries_survive_on_disk() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        fx.pb.dirty(3, &[1u8; 4096]);
        fx.pb.dirty(9, &[2u8; 4096]);
        fx.writer.end_of_tick().unwrap();

        let (header, index_tick, entries) = read_shadow(&config.md_file_path);
        assert_eq!(header.tick(), 1);
        assert_eq!(index_tick, 1);
        let pages: Vec<u64> = entries.iter().map(|e| e.page).collect();
        assert_eq!(pages, vec![3, 9]);
        for entry in &entries {
            assert_ne!(entry.shadow_page, 0);
            assert_eq!(entry.length, 4096);
        }
    }

    #[test]
    fn a_new_page_must_age_out_before_rewrite() {
        let dir = tempdir().unwrap();
        let mut fx = open_writer(writer_config(dir.path()), true);

        // Before page 42 ever reaches the index, the oracle demands the
        // full lag.
        assert_eq!(fx.writer.delay_write(42).unwrap(), 1 + 3);

        fx.pb.dirty(42, &[7u8; 4096]);
        fx.writer.end_of_tick().unwrap();

        // Listed with no pending deadline: no further delay required.
        assert_eq!(fx.writer.delay_write(42).unwrap(), 0);
    }
}

mod index_growth_tests {
    use super::*;
    use shadowtick::SwmrConfig;

    /// A 96-byte page gives the initial region room for exactly 4
    /// entries: (96 - 20) / 16.
    fn tiny_page_config(dir: &std::path::Path) -> SwmrConfig {
        SwmrConfig {
            page_size: 96,
            ..writer_config(dir)
        }
    }

    #[test]
    fn overflowing_the_region_doubles_it_and_parks_the_old_one() {
        let dir = tempdir().unwrap();
        let config = tiny_page_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        for page in 1..=4u64 {
            fx.pb.dirty(page, &[page as u8; 96]);
        }
        fx.writer.end_of_tick().unwrap();
        assert_eq!(fx.writer.index().capacity(), 4);
        assert!(fx.writer.deferred_frees().is_empty());

        fx.pb.dirty(5, &[5u8; 96]);
        fx.writer.end_of_tick().unwrap();

        assert_eq!(fx.writer.index().capacity(), 8);
        assert_eq!(fx.writer.index().used(), 5);

        // The *old* region (at page 1, sized for 4 entries) is parked;
        // the new one is live and advertised by the header.
        assert_eq!(fx.writer.deferred_frees().len(), 1);
        let record = *fx.writer.deferred_frees().iter().next().unwrap();
        assert_eq!(record.offset, 96);
        assert_eq!(record.length, 20 + 4 * 16);
        assert_eq!(record.tick, 2);

        let (header, index_tick, entries) = read_shadow(&config.md_file_path);
        assert_eq!(index_tick, 2);
        assert_ne!(header.index_offset(), 96, "the header SHOULD advertise the new region");
        let pages: Vec<u64> = entries.iter().map(|e| e.page).collect();
        assert_eq!(pages, vec![1, 2, 3, 4, 5], "all five entries SHOULD be on shadow");
    }
}

mod flush_close_tests {
    use super::*;

    #[test]
    fn prep_drains_delayed_writes_a_tick_at_a_time() {
        let dir = tempdir().unwrap();
        let mut fx = open_writer(writer_config(dir.path()), true);

        // Two delayed writes, due at ticks 2 and 3: the immediate EOT
        // clears neither, then two wait-a-tick rounds drain them.
        fx.pb.set_delayed_deadlines(&[2, 3]);
        fx.writer.prep_for_flush_or_close().unwrap();

        assert_eq!(fx.pb.delayed_count(), 0);
        assert_eq!(
            fx.writer.tick(),
            4,
            "one immediate EOT plus exactly two wait-a-tick EOTs"
        );

        let releases = fx
            .log
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::ReleaseDelayedWrites(_)))
            .count();
        assert_eq!(releases, 3);
    }

    #[test]
    fn flush_publishes_an_empty_index_and_advances_one_tick() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        fx.pb.dirty(11, &[9u8; 4096]);
        fx.writer.end_of_tick().unwrap();
        fx.writer.prep_for_flush_or_close().unwrap();

        let before = fx.writer.tick();
        fx.writer.flush().unwrap();
        assert_eq!(fx.writer.tick(), before + 1);

        let (header, index_tick, entries) = read_shadow(&config.md_file_path);
        assert_eq!(header.tick(), before);
        assert_eq!(index_tick, before);
        assert!(
            entries.is_empty(),
            "a flush SHOULD tell readers to resolve everything in the primary file"
        );
    }

    #[test]
    fn close_unlinks_the_shadow_file() {
        let dir = tempdir().unwrap();
        let config = writer_config(dir.path());
        let mut fx = open_writer(config.clone(), true);

        fx.writer.prep_for_flush_or_close().unwrap();
        fx.writer.close().unwrap();

        assert!(!config.md_file_path.exists());
        assert!(fx.scheduler.is_empty(), "close SHOULD deschedule the file");
    }
}

mod scheduler_integration_tests {
    use super::*;

    #[test]
    fn each_eot_rearms_the_scheduler_entry() {
        let dir = tempdir().unwrap();
        let mut fx = open_writer(writer_config(dir.path()), true);

        assert_eq!(fx.scheduler.len(), 1);
        assert!(fx.scheduler.head_is_writer());
        let before = fx.scheduler.head_deadline().unwrap();

        fx.writer.end_of_tick().unwrap();

        assert_eq!(fx.scheduler.len(), 1);
        let entry = fx.scheduler.entries()[0];
        assert_eq!(entry.tick, fx.writer.tick());
        assert!(entry.deadline > before, "the deadline SHOULD move forward");
    }
}
