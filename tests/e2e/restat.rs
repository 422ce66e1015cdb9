use crate::*;

/// A restat rule whose command leaves its output untouched keeps everything
/// downstream clean: edit the source, rerun, and only the restat rule runs.
#[cfg(unix)]
#[test]
fn restat_preserves_downstream() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule maybe_touch
  command = [ -f $out ] || touch $out
  restat = 1
rule copy
  command = cp $in $out
build m: maybe_touch src
build d: copy m
",
    )?;
    space.write("src", "")?;

    let out = space.run_expect(&mut kunai_command(vec!["d"]))?;
    assert_output_contains(&out, "ran 2 tasks");

    // Bump src: the maybe_touch command runs but does not modify m, so the
    // copy does not rerun.
    space.touch("src")?;
    let out = space.run_expect(&mut kunai_command(vec!["d"]))?;
    assert_output_contains(&out, "ran 1 task,");
    assert_output_not_contains(&out, "ran 2");

    // The build log now remembers the input mtime: fully clean.
    let out = space.run_expect(&mut kunai_command(vec!["d"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}
