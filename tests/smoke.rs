use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use log::*;
use memmap2::Mmap;

use tilezip::format::EndOfCentralDirectory;
use tilezip::index::{read_tile, DirectoryIndex};
use tilezip::pipeline::{Pipeline, PipelineConfig};
use tilezip::result::*;
use tilezip::*;

fn write_tile(root: &Path, relative: &str, contents: &[u8]) -> Result<()> {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap())?;
    fs::write(&path, contents).with_context(|| format!("Couldn't write {}", path.display()))
}

/// Finds the EOCDR the way a reader with the whole archive would.
fn eocdr_of(archive: &[u8]) -> Result<(usize, EndOfCentralDirectory<'_>)> {
    let posit = locate(archive)?;
    Ok((posit.offset, posit.record(archive)?))
}

#[test]
fn smoke() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("scratch");
    write_tile(&tiles, "a.jpg", &[b'a'; 100])?;
    write_tile(&tiles, "sub/b.jpg", &[b'b'; 50])?;

    let archive_path = tempdir.path().join("cloud/page/tiles.zip");
    let index_path = tempdir.path().join("cache/page/dir.bin");
    assert_eq!(pack(&tiles, &archive_path)?, 2);
    extract_index(&archive_path, &index_path)?;

    info!("Memory mapping {:#?}", archive_path);
    let archive_file = File::open(&archive_path).context("Couldn't open archive")?;
    let mapping = unsafe { Mmap::map(&archive_file).context("Couldn't mmap archive")? };
    let index_bytes = fs::read(&index_path)?;

    let (eocdr_posit, eocdr) = eocdr_of(&mapping)?;
    assert_eq!(eocdr.entries, 2);
    assert_eq!(
        (eocdr.central_directory_offset + eocdr.central_directory_size) as usize,
        eocdr_posit
    );
    assert_eq!(eocdr_posit + EndOfCentralDirectory::FIXED_SIZE, mapping.len());
    assert_eq!(index_bytes.len(), eocdr.central_directory_size as usize);
    assert_eq!(
        index_bytes[..],
        mapping[eocdr.central_directory_offset as usize..eocdr_posit]
    );

    let index = DirectoryIndex::new(&index_bytes)?;
    let names: Vec<&str> = index.entries().iter().map(|e| e.path.as_str()).collect();
    assert_eq!(names, ["tiles/a.jpg", "tiles/sub/b.jpg"]);

    for (name, expected) in [("a.jpg", vec![b'a'; 100]), ("sub/b.jpg", vec![b'b'; 50])] {
        let entry = index.lookup_tile(name)?;
        assert_eq!(entry.size as usize, expected.len());
        assert_eq!(entry.compressed_size, entry.size);
        assert_eq!(entry.crc32, crc32fast::hash(&expected));

        // What a range request would get back
        let range = entry.data_range();
        assert_eq!(mapping[range.start as usize..range.end as usize], expected[..]);

        let mut contents = Vec::new();
        read_tile(&mapping, entry)?.read_to_end(&mut contents)?;
        assert_eq!(contents, expected);
    }

    tempdir.close()?;
    Ok(())
}

#[test]
fn round_trip_through_the_index() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("tiles-in");
    let mut sources = Vec::new();
    for (i, name) in [
        "info.json",
        "full/90,/0/default.jpg",
        "full/200,/0/default.jpg",
        "0,0,512,512/256,/0/default.jpg",
        "0,512,512,488/256,/0/default.jpg",
        "512,0,488,512/256,/0/default.jpg",
    ]
    .iter()
    .enumerate()
    {
        let contents: Vec<u8> = (0..(i * 97 + 13)).map(|b| (b * (i + 1)) as u8).collect();
        write_tile(&tiles, name, &contents)?;
        sources.push((format!("tiles/{name}"), contents));
    }
    sources.sort();

    let archive_path = tempdir.path().join("tiles.zip");
    let index_path = tempdir.path().join("dir.bin");
    assert_eq!(pack(&tiles, &archive_path)?, sources.len());
    extract_index(&archive_path, &index_path)?;

    let archive = fs::read(&archive_path)?;
    let index_bytes = fs::read(&index_path)?;
    let index = DirectoryIndex::new(&index_bytes)?;
    assert_eq!(index.entries().len(), sources.len());

    // Entries are in name order, so offsets only go up.
    let mut last_offset = None;
    for (entry, (name, contents)) in index.entries().iter().zip(&sources) {
        assert_eq!(entry.path.as_str(), name);
        assert_eq!(entry.size as usize, contents.len());
        assert_eq!(entry.crc32, crc32fast::hash(contents));
        assert!(last_offset < Some(entry.header_offset));
        last_offset = Some(entry.header_offset);

        let mut read_back = Vec::new();
        read_tile(&archive, entry)?.read_to_end(&mut read_back)?;
        assert_eq!(&read_back, contents);
    }
    Ok(())
}

#[test]
fn empty_tile_set() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("nothing");
    fs::create_dir_all(tiles.join("just/folders"))?;

    let archive_path = tempdir.path().join("tiles.zip");
    let index_path = tempdir.path().join("dir.bin");
    assert_eq!(pack(&tiles, &archive_path)?, 0);
    extract_index(&archive_path, &index_path)?;

    let archive = fs::read(&archive_path)?;
    assert_eq!(archive.len(), EndOfCentralDirectory::FIXED_SIZE);
    let (posit, eocdr) = eocdr_of(&archive)?;
    assert_eq!(posit, 0);
    assert_eq!(eocdr.entries, 0);
    assert_eq!(eocdr.central_directory_size, 0);

    let index_bytes = fs::read(&index_path)?;
    assert!(index_bytes.is_empty());
    assert!(DirectoryIndex::new(&index_bytes)?.entries().is_empty());
    Ok(())
}

#[test]
fn missing_tile_set() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let archive_path = tempdir.path().join("tiles.zip");
    match pack(&tempdir.path().join("not-here"), &archive_path) {
        Err(PackError::IOFailure(_)) => { /* Cool. */ }
        other => panic!("Expected an I/O failure, got {:?}", other),
    }
    assert!(!archive_path.exists());
    Ok(())
}

#[test]
fn clobbered_trailer() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("scratch");
    write_tile(&tiles, "a.jpg", b"not really a jpeg")?;
    let archive_path = tempdir.path().join("tiles.zip");
    pack(&tiles, &archive_path)?;

    let mut archive = fs::read(&archive_path)?;
    let len = archive.len();
    archive[len - 30..].fill(0xEE);
    fs::write(&archive_path, &archive)?;

    assert!(matches!(
        locate(&archive),
        Err(LocateError::MalformedArchive(_))
    ));
    let index_path = tempdir.path().join("dir.bin");
    assert!(matches!(
        extract_index(&archive_path, &index_path),
        Err(ExtractError::Locate(LocateError::MalformedArchive(_)))
    ));
    assert!(!index_path.exists());
    Ok(())
}

#[test]
fn comment_after_the_record() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("scratch");
    write_tile(&tiles, "a.jpg", b"aaaa")?;
    let archive_path = tempdir.path().join("tiles.zip");
    pack(&tiles, &archive_path)?;
    let plain = fs::read(&archive_path)?;

    // Tack on a comment, like other tools might.
    let comment = b"Packed for the 1897 run of the Evening Record";
    let mut commented = plain.clone();
    let len_field = commented.len() - 2;
    commented[len_field..].copy_from_slice(&(comment.len() as u16).to_le_bytes());
    commented.extend_from_slice(comment);
    fs::write(&archive_path, &commented)?;

    let index_path = tempdir.path().join("dir.bin");
    extract_index(&archive_path, &index_path)?;
    let (posit, eocdr) = eocdr_of(&plain)?;
    assert_eq!(
        fs::read(&index_path)?,
        &plain[eocdr.central_directory_offset as usize..posit]
    );
    Ok(())
}

#[test]
fn truncated_archive() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let tiles = tempdir.path().join("scratch");
    write_tile(&tiles, "a.jpg", &[1; 64])?;
    write_tile(&tiles, "b.jpg", &[2; 64])?;
    let archive_path = tempdir.path().join("tiles.zip");
    pack(&tiles, &archive_path)?;

    // Keep the EOCDR, but lose the central directory in front of it.
    let archive = fs::read(&archive_path)?;
    let (posit, eocdr) = eocdr_of(&archive)?;
    let cut = eocdr.central_directory_offset as usize + 20;
    let mut truncated = archive[..cut].to_vec();
    truncated.extend_from_slice(&archive[posit..]);
    fs::write(&archive_path, &truncated)?;

    match extract_index(&archive_path, &tempdir.path().join("dir.bin")) {
        Err(ExtractError::TruncatedRead {
            expected, actual, ..
        }) => {
            assert_eq!(expected, eocdr.central_directory_size as u64);
            assert_eq!(actual, 20 + EndOfCentralDirectory::FIXED_SIZE as u64);
        }
        other => panic!("Expected TruncatedRead, got {:?}", other),
    }
    Ok(())
}

#[test]
fn pipeline_stores() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();

    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let config = PipelineConfig::new(out.join("cloud"), out.join("cache"));
    let pipeline = Pipeline::new(config);

    let producer = |identifier: &str, into: &Path| -> io::Result<()> {
        fs::write(into.join("info.json"), format!("{{\"@id\": \"{identifier}\"}}"))?;
        fs::create_dir_all(into.join("full/90,/0"))?;
        fs::write(into.join("full/90,/0/default.jpg"), b"\xFF\xD8\xFF")
    };
    let outputs = pipeline.produce_and_process(&producer, "pub/1897-03-02/page-4")?;

    assert_eq!(outputs.entries, Some(2));
    assert_eq!(
        outputs.archive,
        out.join("cloud/pub/1897-03-02/page-4/tiles.zip")
    );
    assert_eq!(outputs.index, out.join("cache/pub/1897-03-02/page-4/dir.bin"));

    let index_bytes = fs::read(&outputs.index)?;
    let index = DirectoryIndex::new(&index_bytes)?;
    assert_eq!(index.lookup_tile("full/90,/0/default.jpg")?.size, 3);
    assert_eq!(
        index.lookup_tile("info.json")?.size as usize,
        "{\"@id\": \"pub/1897-03-02/page-4\"}".len()
    );
    Ok(())
}

#[test]
fn failed_producer_leaves_nothing() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let pipeline = Pipeline::new(PipelineConfig::new(out.join("cloud"), out.join("cache")));

    let broken = |_: &str, _: &Path| -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "tile cutter crashed"))
    };
    assert!(matches!(
        pipeline.produce_and_process(&broken, "page-1"),
        Err(PipelineError::TileSource { .. })
    ));
    assert!(!out.join("cloud/page-1/tiles.zip").exists());
    assert!(!out.join("cache/page-1/dir.bin").exists());
    Ok(())
}

#[test]
fn skip_existing() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let tiles = out.join("scratch");
    write_tile(&tiles, "a.jpg", b"first")?;

    let mut config = PipelineConfig::new(out.join("cloud"), out.join("cache"));
    config.skip_existing = true;
    let pipeline = Pipeline::new(config);

    assert_eq!(pipeline.process(&tiles, "page")?.entries, Some(1));
    let first = fs::read(out.join("cloud/page/tiles.zip"))?;

    write_tile(&tiles, "b.jpg", b"second")?;
    assert_eq!(pipeline.process(&tiles, "page")?.entries, None);
    assert_eq!(fs::read(out.join("cloud/page/tiles.zip"))?, first);
    Ok(())
}

#[test]
fn failed_pack_removes_orphaned_index() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let pipeline = Pipeline::new(PipelineConfig::new(out.join("cloud"), out.join("cache")));

    // Left over from some earlier run whose archive is gone.
    let index = out.join("cache/page/dir.bin");
    fs::create_dir_all(index.parent().unwrap())?;
    fs::write(&index, b"a central directory for nothing")?;

    match pipeline.process(&out.join("no-such-tiles"), "page") {
        Err(PipelineError::Pack { identifier, .. }) => assert_eq!(identifier, "page"),
        other => panic!("Expected a pack error, got {:?}", other),
    }
    assert!(!out.join("cloud/page/tiles.zip").exists());
    assert!(!index.exists());
    Ok(())
}

#[test]
fn failed_pack_keeps_previous_outputs() -> Result<()> {
    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let tiles = out.join("scratch");
    write_tile(&tiles, "a.jpg", b"first")?;

    let pipeline = Pipeline::new(PipelineConfig::new(out.join("cloud"), out.join("cache")));
    let outputs = pipeline.process(&tiles, "page")?;
    let archive = fs::read(&outputs.archive)?;
    let index = fs::read(&outputs.index)?;

    // The old archive is untouched, so its index is still good.
    assert!(matches!(
        pipeline.process(&out.join("no-such-tiles"), "page"),
        Err(PipelineError::Pack { .. })
    ));
    assert_eq!(fs::read(&outputs.archive)?, archive);
    assert_eq!(fs::read(&outputs.index)?, index);
    Ok(())
}

#[cfg(unix)]
#[test]
fn outputs_are_world_readable() -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let tempdir = tempfile::tempdir()?;
    let out = tempdir.path();
    let tiles = out.join("scratch");
    write_tile(&tiles, "a.jpg", b"some tile")?;

    let pipeline = Pipeline::new(PipelineConfig::new(out.join("cloud"), out.join("cache")));
    let outputs = pipeline.process(&tiles, "page")?;

    // Whatever the umask takes away from a plain file, it takes away from ours.
    let plain = out.join("plain");
    fs::write(&plain, b"")?;
    let mode = |path: &Path| -> Result<u32> {
        Ok(fs::metadata(path)?.permissions().mode() & 0o777)
    };
    let expected = 0o644 & mode(&plain)?;

    assert_eq!(mode(&outputs.archive)?, expected, "archive mode");
    assert_eq!(mode(&outputs.index)?, expected, "index mode");
    Ok(())
}
