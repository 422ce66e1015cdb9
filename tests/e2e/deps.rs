use crate::*;

/// Header discovery through a depfile that stays on disk.
#[cfg(unix)]
#[test]
fn depfile_discovers_headers() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = printf 'main.o: hdr.h\\n' > $out.d && touch $out
  depfile = $out.d
build main.o: cc main.c
",
    )?;
    space.write("main.c", "")?;
    space.write("hdr.h", "")?;

    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");

    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "no work to do");

    // Touching the discovered header dirties the output.
    space.touch("hdr.h")?;
    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

/// With `deps = gcc` the depfile is consumed into the deps log and deleted;
/// later builds get the dependency from the log alone.
#[cfg(unix)]
#[test]
fn deps_log_persists_discovered_deps() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cc
  command = printf 'main.o: hdr.h\\n' > $out.d && touch $out
  deps = gcc
  depfile = $out.d
build main.o: cc main.c
",
    )?;
    space.write("main.c", "")?;
    space.write("hdr.h", "")?;

    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");
    // The depfile is gone; the binary deps log holds the edge.
    assert!(space.read("main.o.d").is_err());
    assert!(space.read(".ninja_deps").is_ok());

    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "no work to do");

    space.touch("hdr.h")?;
    let out = space.run_expect(&mut kunai_command(vec!["main.o"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}
