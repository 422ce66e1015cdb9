use crate::*;

#[test]
fn empty_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write("build.ninja", "")?;
    let out = space.run_expect(&mut kunai_command(vec![]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn basic_build_and_null_build() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;

    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert!(space.read("out").is_ok());

    // The build log recorded the command against its output.
    let log = space.read(".ninja_log")?;
    let log = String::from_utf8_lossy(&log);
    assert!(log.starts_with("# ninja log v5"));
    assert!(log.contains("\tout\t"));

    // A second invocation with no changes runs zero commands.
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn create_subdir() -> anyhow::Result<()> {
    // A build rule whose output needs a directory automatically created.
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build subdir/out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kunai_command(vec!["subdir/out"]))?;
    assert!(space.read("subdir/out").is_ok());
    Ok(())
}

#[cfg(unix)]
#[test]
fn changed_command_invalidates() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kunai_command(vec!["out"]))?;

    // Change only the rule's command; no file changed on disk.
    let changed = TOUCH_RULE.replace("command = touch $out", "command = touch $out # v2");
    space.write(
        "build.ninja",
        &[changed.as_str(), "build out: touch in", ""].join("\n"),
    )?;
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");

    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "no work to do");
    Ok(())
}

#[test]
fn touched_input_rebuilds() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kunai_command(vec!["out"]))?;

    space.touch("in")?;
    let out = space.run_expect(&mut kunai_command(vec!["out"]))?;
    assert_output_contains(&out, "ran 1 task");
    Ok(())
}

#[test]
fn default_targets() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[
            TOUCH_RULE,
            "build a: touch in",
            "build b: touch in",
            "default a",
            "",
        ]
        .join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kunai_command(vec![]))?;
    assert!(space.read("a").is_ok());
    assert!(space.read("b").is_err());
    Ok(())
}

#[test]
fn specify_build_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build_specified.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    space.run_expect(&mut kunai_command(vec![
        "-f",
        "build_specified.ninja",
        "out",
    ]))?;
    assert!(space.read("out").is_ok());
    Ok(())
}

#[test]
fn dry_run_runs_nothing() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        &[TOUCH_RULE, "build out: touch in", ""].join("\n"),
    )?;
    space.write("in", "")?;
    let out = space.run_expect(&mut kunai_command(vec!["-n", "out"]))?;
    assert_output_contains(&out, "ran 1 task");
    assert!(space.read("out").is_err());
    Ok(())
}

#[cfg(unix)]
#[test]
fn generate_rsp_file() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule cat
  command = cat ${out}.rsp > ${out}
  rspfile = ${out}.rsp
  rspfile_content = 1 $in 2 $in_newline 3

rule litter
  command = cat make/me/${out}.rsp > ${out}
  rspfile = make/me/${out}.rsp
  rspfile_content = random stuff

rule touch
  command = touch $out

build main: cat foo bar baz in
build foo: litter bar
build bar: touch baz
build baz: touch in
",
    )?;
    space.write("in", "go!")?;

    space.run_expect(&mut kunai_command(vec!["main"]))?;

    // The 'main' and 'foo' targets copy the contents of their rsp file to
    // their output.
    let main_rsp = space.read("main").unwrap();
    assert_eq!(main_rsp, b"1 foo bar baz in 2 foo\nbar\nbaz\nin 3");
    let foo_rsp = space.read("foo").unwrap();
    assert_eq!(foo_rsp, b"random stuff");

    // The rsp files themselves were cleaned up after success, but the
    // directory created for one remains.
    assert!(space.read("main.rsp").is_err());
    let meta = space.metadata("make/me").unwrap();
    assert!(meta.is_dir());

    // Run again: everything should be up to date.
    let out = space.run_expect(&mut kunai_command(vec!["main"]))?;
    assert_output_contains(&out, "no work");
    Ok(())
}

#[cfg(unix)]
#[test]
fn failing_command_output_is_shown() -> anyhow::Result<()> {
    let space = TestSpace::new()?;
    space.write(
        "build.ninja",
        "
rule fail
  command = echo build exploded && exit 1
build out: fail in
",
    )?;
    space.write("in", "")?;
    let out = space.run(&mut kunai_command(vec!["out"]))?;
    assert!(!out.status.success());
    assert_output_contains(&out, "build exploded");
    assert_output_contains(&out, "subcommand failed");
    Ok(())
}
